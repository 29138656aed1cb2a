//! Per-entity sync watermarks derived from the events already in the columnar store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use forgelog_core::{flexible_u64, EntityKind, Platform, Watermark};
use forgelog_storage::{ColumnarGateway, GatewayError};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub type WatermarkMap = HashMap<(EntityKind, String), Watermark>;

pub struct WatermarkStore {
    gateway: Arc<dyn ColumnarGateway>,
    event_table: String,
}

impl WatermarkStore {
    pub fn new(gateway: Arc<dyn ColumnarGateway>, event_table: impl Into<String>) -> Self {
        Self {
            gateway,
            event_table: event_table.into(),
        }
    }

    /// Newest and oldest event id per org login and per repo name for `platform`.
    pub async fn load(&self, platform: Platform) -> Result<WatermarkMap, GatewayError> {
        let mut out = WatermarkMap::new();
        for (kind, column) in [(EntityKind::Org, "org_login"), (EntityKind::Repo, "repo_name")] {
            let sql = watermark_sql(&self.event_table, column);
            let rows = self
                .gateway
                .query(&sql, &[("platform", platform.as_str().to_string())])
                .await?;
            for row in rows {
                match parse_row(&row) {
                    Some((name, watermark)) => {
                        out.insert((kind, name), watermark);
                    }
                    None => warn!(?row, column, "skipping unreadable watermark row"),
                }
            }
        }
        debug!(%platform, entities = out.len(), "watermarks loaded");
        Ok(out)
    }
}

fn watermark_sql(table: &str, column: &str) -> String {
    format!(
        "SELECT {column}, argMax(id, created_at), argMin(id, created_at), min(created_at) \
         FROM {table} WHERE platform = {{platform:String}} GROUP BY {column}"
    )
}

fn parse_row(row: &[JsonValue]) -> Option<(String, Watermark)> {
    let name = row.first()?.as_str()?;
    if name.is_empty() {
        return None;
    }
    Some((
        name.to_string(),
        Watermark {
            max_id: flexible_u64(row.get(1)?)?,
            min_id: flexible_u64(row.get(2)?)?,
            min_created_at: row.get(3).and_then(JsonValue::as_str).and_then(parse_store_time),
        },
    ))
}

/// Parses the store's `YYYY-MM-DD HH:MM:SS` text form (UTC).
pub fn parse_store_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryGateway;
    use serde_json::json;

    #[tokio::test]
    async fn loads_org_and_repo_watermarks_separately() {
        let gateway = Arc::new(MemoryGateway::default());
        gateway.respond(
            "GROUP BY org_login",
            vec![
                vec![json!("openharmony"), json!("9000"), json!("100"), json!("2021-06-01 00:00:00")],
                vec![json!(""), json!("1"), json!("1"), json!("2021-06-01 00:00:00")],
            ],
        );
        gateway.respond(
            "GROUP BY repo_name",
            vec![vec![json!("openharmony/kernel"), json!(8000), json!(200), json!("2021-07-01 12:00:00")]],
        );

        let store = WatermarkStore::new(gateway.clone(), "events");
        let map = store.load(Platform::Gitee).await.unwrap();

        assert_eq!(map.len(), 2);
        let org = map[&(EntityKind::Org, "openharmony".to_string())];
        assert_eq!((org.max_id, org.min_id), (9000, 100));
        assert_eq!(
            org.min_created_at.map(|t| t.to_rfc3339()),
            Some("2021-06-01T00:00:00+00:00".to_string())
        );
        assert_eq!(map[&(EntityKind::Repo, "openharmony/kernel".to_string())].max_id, 8000);
        assert!(gateway.queries.lock().unwrap()[0].contains("argMax(id, created_at)"));
    }
}
