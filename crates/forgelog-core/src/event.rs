//! Raw vendor events as they arrive from a platform API page or an archive line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Code-hosting platform an event stream originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    GitHub,
    Gitee,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GitHub => "GitHub",
            Platform::Gitee => "Gitee",
        }
    }

    /// Radix of issue numbers as reported by the platform.
    ///
    /// Gitee issue identifiers such as `I4ABCD` are base-36 strings; GitHub uses plain decimals.
    pub fn issue_number_radix(&self) -> u32 {
        match self {
            Platform::GitHub => 10,
            Platform::Gitee => 36,
        }
    }

    pub fn pull_number_radix(&self) -> u32 {
        10
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawActor {
    #[serde(deserialize_with = "de_flexible_u64")]
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRepo {
    #[serde(deserialize_with = "de_flexible_u64")]
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl RawRepo {
    /// `owner/name` form; Gitee carries it as `full_name`, GitHub archives as `name`.
    pub fn display_name(&self) -> Option<&str> {
        self.full_name.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(deserialize_with = "de_flexible_u64")]
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub actor: Option<RawActor>,
    #[serde(default)]
    pub repo: Option<RawRepo>,
    #[serde(default)]
    pub org: Option<RawActor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Option<JsonValue>,
}

impl RawEvent {
    pub fn from_value(value: JsonValue) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn action(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("action"))
            .and_then(JsonValue::as_str)
    }
}

/// Reads an id that may be encoded as a JSON number or as a decimal string.
pub fn flexible_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    flexible_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer id, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_numbers_and_strings() {
        let raw = RawEvent::from_value(json!({
            "id": "26170139709",
            "type": "WatchEvent",
            "actor": {"id": 1, "login": "octocat"},
            "repo": {"id": "42", "name": "octo/repo"},
            "created_at": "2023-01-01T00:00:00Z",
            "payload": {"action": "started"}
        }))
        .unwrap();
        assert_eq!(raw.id, 26_170_139_709);
        assert_eq!(raw.repo.as_ref().unwrap().id, 42);
        assert_eq!(raw.action(), Some("started"));
    }

    #[test]
    fn gitee_full_name_takes_precedence() {
        let repo = RawRepo {
            id: 1,
            name: Some("repo".into()),
            full_name: Some("owner/repo".into()),
        };
        assert_eq!(repo.display_name(), Some("owner/repo"));
    }

    #[test]
    fn null_type_and_offset_timestamps_parse() {
        let raw = RawEvent::from_value(json!({
            "id": 7,
            "type": null,
            "created_at": "2023-05-01T08:00:00+08:00"
        }))
        .unwrap();
        assert!(raw.kind.is_none());
        assert_eq!(raw.created_at.to_rfc3339(), "2023-05-01T00:00:00+00:00");
    }
}
