//! Platform event normalizers: raw vendor events in, canonical records (or a drop reason) out.

mod extract;
pub mod gitee;
pub mod github;

use forgelog_core::{CanonicalEvent, CanonicalEventType, EventPayload, Platform, RawEvent, UserRef};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use extract::ExtractError;
pub use gitee::GiteeNormalizer;
pub use github::GitHubNormalizer;

pub const CRATE_NAME: &str = "forgelog-adapters";

/// Result of looking up a vendor action in a platform's action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMapping {
    Mapped(&'static str),
    /// Known action that carries nothing worth storing.
    NoOp,
    Unknown,
}

/// Why an event did not make it into the canonical stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Dropped {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unsupported event type {0:?}")]
    UnsupportedType(Option<String>),
    #[error("unknown event type {0}")]
    UnknownType(String),
    #[error("event has no actor or repo")]
    MissingActorOrRepo,
    #[error("event has no payload")]
    MissingPayload,
    #[error("no-op action {0}")]
    NoOpAction(String),
    #[error("unknown action {0}")]
    UnknownAction(String),
    #[error("payload extraction failed: {0}")]
    Extraction(#[from] ExtractError),
}

impl Dropped {
    /// Drops that point at vendor data this code does not understand.
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            Dropped::Malformed(_)
                | Dropped::UnknownType(_)
                | Dropped::UnknownAction(_)
                | Dropped::Extraction(_)
        )
    }
}

pub trait EventNormalizer: Send + Sync {
    fn platform(&self) -> Platform;

    /// Vendor types that are deliberately ignored; `None` is a null/absent type.
    fn is_unsupported(&self, kind: Option<&str>) -> bool;

    fn supported_type(&self, kind: &str) -> Option<CanonicalEventType>;

    fn map_action(&self, action: &str) -> ActionMapping;

    fn extract(
        &self,
        kind: CanonicalEventType,
        payload: &JsonValue,
    ) -> Result<EventPayload, ExtractError>;

    fn normalize(&self, value: &JsonValue) -> Result<CanonicalEvent, Dropped> {
        normalize_event(self, value)
    }
}

/// Runs the drop pipeline for one raw event. Never panics; every failure becomes a `Dropped`.
pub fn normalize_event<N>(normalizer: &N, value: &JsonValue) -> Result<CanonicalEvent, Dropped>
where
    N: EventNormalizer + ?Sized,
{
    let result = classify_and_extract(normalizer, value);
    if let Err(dropped) = &result {
        log_dropped(normalizer.platform(), dropped, value);
    }
    result
}

fn classify_and_extract<N>(normalizer: &N, value: &JsonValue) -> Result<CanonicalEvent, Dropped>
where
    N: EventNormalizer + ?Sized,
{
    let kind = value.get("type").and_then(JsonValue::as_str);
    if normalizer.is_unsupported(kind) {
        return Err(Dropped::UnsupportedType(kind.map(ToString::to_string)));
    }
    let Some(kind) = kind else {
        return Err(Dropped::UnsupportedType(None));
    };
    let canonical = normalizer
        .supported_type(kind)
        .ok_or_else(|| Dropped::UnknownType(kind.to_string()))?;

    let raw = RawEvent::deserialize(value).map_err(|e| Dropped::Malformed(e.to_string()))?;
    let (Some(actor), Some(repo)) = (&raw.actor, &raw.repo) else {
        return Err(Dropped::MissingActorOrRepo);
    };
    let repo_name = repo
        .display_name()
        .ok_or(Dropped::MissingActorOrRepo)?
        .to_string();
    let payload = raw.payload.as_ref().ok_or(Dropped::MissingPayload)?;

    let mut action = match raw.action() {
        None => None,
        Some(a) => match normalizer.map_action(a) {
            ActionMapping::Mapped(mapped) => Some(mapped.to_string()),
            ActionMapping::NoOp => return Err(Dropped::NoOpAction(a.to_string())),
            ActionMapping::Unknown => return Err(Dropped::UnknownAction(a.to_string())),
        },
    };
    if canonical.is_comment() {
        action = Some("created".to_string());
    }

    let payload = normalizer.extract(canonical, payload)?;

    Ok(CanonicalEvent {
        platform: normalizer.platform(),
        id: raw.id,
        actor: UserRef {
            id: actor.id,
            login: actor.login.clone(),
        },
        repo_id: repo.id,
        repo_name,
        org: raw.org.as_ref().map(|o| UserRef {
            id: o.id,
            login: o.login.clone(),
        }),
        created_at: raw.created_at,
        action,
        payload,
    })
}

fn log_dropped(platform: Platform, dropped: &Dropped, raw: &JsonValue) {
    match dropped {
        Dropped::UnknownType(kind) => warn!(%platform, kind, "unknown event type"),
        Dropped::UnknownAction(action) => error!(%platform, action, "unknown action"),
        Dropped::Malformed(_) | Dropped::Extraction(_) => {
            warn!(%platform, reason = %dropped, raw = %raw, "error on parse event")
        }
        _ => debug!(%platform, reason = %dropped, "event dropped"),
    }
}

pub fn normalizer_for(platform: Platform) -> Box<dyn EventNormalizer> {
    match platform {
        Platform::Gitee => Box::new(GiteeNormalizer),
        Platform::GitHub => Box::new(GitHubNormalizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_returns_matching_platform() {
        assert_eq!(normalizer_for(Platform::Gitee).platform(), Platform::Gitee);
        assert_eq!(normalizer_for(Platform::GitHub).platform(), Platform::GitHub);
    }

    #[test]
    fn bad_created_at_is_malformed_not_a_panic() {
        let raw = json!({
            "id": 1,
            "type": "StarEvent",
            "actor": {"id": 1, "login": "a"},
            "repo": {"id": 2, "full_name": "o/r"},
            "created_at": "yesterday",
            "payload": {}
        });
        let dropped = GiteeNormalizer.normalize(&raw).unwrap_err();
        assert!(matches!(dropped, Dropped::Malformed(_)));
        assert!(dropped.is_anomaly());
    }

    #[test]
    fn expected_drops_are_not_anomalies() {
        assert!(!Dropped::UnsupportedType(None).is_anomaly());
        assert!(!Dropped::NoOpAction("progressing".into()).is_anomaly());
        assert!(Dropped::UnknownType("FooEvent".into()).is_anomaly());
    }
}
