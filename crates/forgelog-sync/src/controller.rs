//! Watermark-driven incremental sync of reverse-chronological platform event feeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgelog_adapters::EventNormalizer;
use forgelog_core::{flexible_u64, EntityKind, PageEntry, Platform, SyncCursor, TrackedEntity};
use forgelog_storage::{
    ColumnarGateway, FetchError, FetchTask, FetchedResponse, RequestExecutor, ResponseHandler, Row,
    TaskQueue,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::watermark::WatermarkStore;

/// Where the next page of an entity's event feed lives.
pub trait EventFeed: Send + Sync {
    fn platform(&self) -> Platform;

    /// `prev_id < 0` asks for the newest page.
    fn page_url(&self, entity: &TrackedEntity, prev_id: i64) -> String;
}

#[derive(Debug, Clone)]
pub struct GiteeFeed {
    pub api_base: String,
    pub token: String,
    pub page_size: usize,
}

impl GiteeFeed {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            page_size: 50,
        }
    }
}

impl EventFeed for GiteeFeed {
    fn platform(&self) -> Platform {
        Platform::Gitee
    }

    fn page_url(&self, entity: &TrackedEntity, prev_id: i64) -> String {
        let base = self.api_base.trim_end_matches('/');
        let scope = match entity.kind {
            EntityKind::Org => "orgs",
            EntityKind::Repo => "networks",
        };
        let mut url = format!("{base}/{scope}/{}/events?limit={}", entity.name, self.page_size);
        if !self.token.is_empty() {
            url.push_str(&format!("&access_token={}", self.token));
        }
        if prev_id > 0 {
            url.push_str(&format!("&prev_id={prev_id}"));
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub platform: Platform,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub pages: usize,
    pub inserted: usize,
    pub dropped: usize,
    pub failed: usize,
    /// Final cursor of every entity chain, in completion order.
    pub cursors: Vec<SyncCursor>,
}

struct EventPageHandler {
    feed: Arc<dyn EventFeed>,
    normalizer: Arc<dyn EventNormalizer>,
    gateway: Arc<dyn ColumnarGateway>,
    event_table: String,
    threshold: chrono::Duration,
    pages: AtomicUsize,
    inserted: AtomicUsize,
    dropped: AtomicUsize,
    failed: AtomicUsize,
    finished: Mutex<Vec<SyncCursor>>,
}

impl EventPageHandler {
    fn finish(&self, cursor: SyncCursor) {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(cursor);
    }

    fn page_entries(&self, events: &[JsonValue]) -> Vec<PageEntry<Row>> {
        let mut entries = Vec::with_capacity(events.len());
        for raw in events {
            let Some(id) = raw.get("id").and_then(flexible_u64) else {
                warn!(raw = %raw, "event without id skipped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let record = match self.normalizer.normalize(raw) {
                Ok(event) => Some(event.to_row()),
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            };
            entries.push(PageEntry { id, record });
        }
        entries
    }
}

#[async_trait]
impl ResponseHandler<SyncCursor> for EventPageHandler {
    async fn on_response(
        &self,
        outcome: Result<FetchedResponse, FetchError>,
        task: FetchTask<SyncCursor>,
        queue: &TaskQueue<SyncCursor>,
    ) {
        let mut cursor = task.user_data;
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                warn!(entity = %cursor.entity.name, error = %err, "event page fetch failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.finish(cursor);
                return;
            }
        };
        let events: Vec<JsonValue> = match serde_json::from_slice(&response.body) {
            Ok(events) => events,
            Err(err) => {
                warn!(entity = %cursor.entity.name, url = %response.final_url, error = %err, "event page is not a JSON array");
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.finish(cursor);
                return;
            }
        };
        self.pages.fetch_add(1, Ordering::Relaxed);

        let step = cursor.advance(self.page_entries(&events), self.threshold);
        let count = step.to_insert.len();
        if count > 0 {
            if let Err(err) = self.gateway.insert(&self.event_table, step.to_insert).await {
                error!(entity = %cursor.entity.name, error = %err, "event insert failed; stopping this entity");
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.finish(cursor);
                return;
            }
            self.inserted.fetch_add(count, Ordering::Relaxed);
        }

        if step.fetch_next {
            let url = self.feed.page_url(&cursor.entity, cursor.prev_id);
            queue.push(FetchTask::get(url, cursor));
        } else {
            self.finish(cursor);
        }
    }
}

pub struct IncrementalSyncController {
    executor: RequestExecutor,
    watermarks: WatermarkStore,
    gateway: Arc<dyn ColumnarGateway>,
    event_table: String,
    feed: Arc<dyn EventFeed>,
    normalizer: Arc<dyn EventNormalizer>,
    threshold: chrono::Duration,
}

impl IncrementalSyncController {
    pub fn new(
        executor: RequestExecutor,
        gateway: Arc<dyn ColumnarGateway>,
        event_table: impl Into<String>,
        feed: Arc<dyn EventFeed>,
        normalizer: Arc<dyn EventNormalizer>,
        threshold: chrono::Duration,
    ) -> Self {
        let event_table = event_table.into();
        Self {
            executor,
            watermarks: WatermarkStore::new(Arc::clone(&gateway), event_table.clone()),
            gateway,
            event_table,
            feed,
            normalizer,
            threshold,
        }
    }

    pub async fn run(&self, entities: Vec<TrackedEntity>) -> Result<SyncReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let platform = self.feed.platform();
        let watermarks = self
            .watermarks
            .load(platform)
            .await
            .context("loading sync watermarks")?;

        let entity_count = entities.len();
        let initial: Vec<_> = entities
            .into_iter()
            .map(|entity| {
                let watermark = watermarks
                    .get(&(entity.kind, entity.name.clone()))
                    .copied()
                    .unwrap_or_default();
                let cursor = SyncCursor::new(entity, watermark);
                FetchTask::get(self.feed.page_url(&cursor.entity, cursor.prev_id), cursor)
            })
            .collect();
        info!(%run_id, %platform, entities = entity_count, "incremental sync started");

        let handler = Arc::new(EventPageHandler {
            feed: Arc::clone(&self.feed),
            normalizer: Arc::clone(&self.normalizer),
            gateway: Arc::clone(&self.gateway),
            event_table: self.event_table.clone(),
            threshold: self.threshold,
            pages: AtomicUsize::new(0),
            inserted: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
        });
        self.executor.drain(initial, Arc::clone(&handler)).await;

        let cursors = std::mem::take(
            &mut *handler
                .finished
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let report = SyncReport {
            run_id,
            platform,
            started_at,
            finished_at: Utc::now(),
            entities: entity_count,
            pages: handler.pages.load(Ordering::Relaxed),
            inserted: handler.inserted.load(Ordering::Relaxed),
            dropped: handler.dropped.load(Ordering::Relaxed),
            failed: handler.failed.load(Ordering::Relaxed),
            cursors,
        };
        info!(
            %run_id,
            pages = report.pages,
            inserted = report.inserted,
            dropped = report.dropped,
            failed = report.failed,
            "incremental sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CannedTransport, MemoryGateway};
    use chrono::TimeZone;
    use forgelog_adapters::GiteeNormalizer;
    use forgelog_core::SyncStage;
    use forgelog_storage::ExecutorOptions;
    use serde_json::json;
    use std::time::Duration;

    const BASE: &str = "https://gitee.test/api/v5";

    fn star(id: u64, repo: &str) -> JsonValue {
        json!({
            "id": id,
            "type": "StarEvent",
            "actor": {"id": 7, "login": "fan"},
            "repo": {"id": 501, "full_name": repo},
            "org": {"id": 31, "login": "openharmony"},
            "created_at": "2024-03-01T00:00:00+08:00",
            "payload": {"action": "starred"}
        })
    }

    fn entity(name: &str, kind: EntityKind, created_day: Option<u32>) -> TrackedEntity {
        TrackedEntity {
            name: name.into(),
            kind,
            created_at: created_day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
        }
    }

    fn controller(transport: Arc<CannedTransport>, gateway: Arc<MemoryGateway>) -> IncrementalSyncController {
        let options = ExecutorOptions {
            batch_size: 2,
            retries: 0,
            retry_interval: Duration::from_millis(1),
        };
        IncrementalSyncController::new(
            RequestExecutor::new(transport, options),
            gateway,
            "events",
            Arc::new(GiteeFeed::new(BASE, "")),
            Arc::new(GiteeNormalizer),
            chrono::Duration::days(3),
        )
    }

    #[test]
    fn gitee_urls_follow_entity_kind_and_cursor() {
        let feed = GiteeFeed::new("https://gitee.com/api/v5/", "tok");
        let org = entity("openharmony", EntityKind::Org, None);
        let repo = entity("openharmony/docs", EntityKind::Repo, None);
        assert_eq!(
            feed.page_url(&org, -1),
            "https://gitee.com/api/v5/orgs/openharmony/events?limit=50&access_token=tok"
        );
        assert_eq!(
            feed.page_url(&repo, 42),
            "https://gitee.com/api/v5/networks/openharmony/docs/events?limit=50&access_token=tok&prev_id=42"
        );
    }

    #[tokio::test]
    async fn walks_new_then_old_and_stops_on_backfilled_entities() {
        let gateway = Arc::new(MemoryGateway::default());
        gateway.respond(
            "GROUP BY org_login",
            vec![vec![json!("openharmony"), json!("100"), json!("40"), json!("2024-01-20 00:00:00")]],
        );
        gateway.respond(
            "GROUP BY repo_name",
            vec![vec![json!("mindspore/docs"), json!("50"), json!("10"), json!("2024-01-02 00:00:00")]],
        );

        let transport = Arc::new(CannedTransport::default());
        let org_url = format!("{BASE}/orgs/openharmony/events?limit=50");
        transport.serve(
            &org_url,
            json!([star(120, "openharmony/a"), {"id": 110, "type": "CreateEvent"}, star(100, "openharmony/a")]),
        );
        transport.serve(&format!("{org_url}&prev_id=40"), json!([star(39, "openharmony/a"), star(38, "openharmony/a")]));
        transport.serve(&format!("{org_url}&prev_id=38"), json!([]));

        let fresh_url = format!("{BASE}/networks/openharmony/fresh/events?limit=50");
        transport.serve(&fresh_url, json!([star(7, "openharmony/fresh"), star(6, "openharmony/fresh")]));
        transport.serve(&format!("{fresh_url}&prev_id=6"), json!([]));

        let done_url = format!("{BASE}/networks/mindspore/docs/events?limit=50");
        transport.serve(&done_url, json!([star(60, "mindspore/docs"), star(50, "mindspore/docs"), star(49, "mindspore/docs")]));

        let report = controller(Arc::clone(&transport), Arc::clone(&gateway))
            .run(vec![
                entity("openharmony", EntityKind::Org, Some(1)),
                entity("openharmony/fresh", EntityKind::Repo, None),
                entity("mindspore/docs", EntityKind::Repo, Some(1)),
            ])
            .await
            .unwrap();

        let mut ids: Vec<u64> = gateway
            .inserted("events")
            .iter()
            .map(|row| row["id"].as_u64().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![6, 7, 38, 39, 60, 120]);
        assert_eq!(report.inserted, 6);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.pages, 6);

        let stage_of = |name: &str| {
            report
                .cursors
                .iter()
                .find(|c| c.entity.name == name)
                .map(|c| c.stage)
                .unwrap()
        };
        assert_eq!(stage_of("openharmony"), SyncStage::Old);
        assert_eq!(stage_of("openharmony/fresh"), SyncStage::New);
        assert_eq!(stage_of("mindspore/docs"), SyncStage::Break);
        assert!(!transport
            .requested
            .lock()
            .unwrap()
            .iter()
            .any(|u| u.contains("mindspore/docs/events?limit=50&prev_id")));
    }

    #[tokio::test]
    async fn failed_fetch_ends_only_that_entity() {
        let gateway = Arc::new(MemoryGateway::default());
        let transport = Arc::new(CannedTransport::default());
        let ok_url = format!("{BASE}/orgs/ok/events?limit=50");
        transport.serve(&ok_url, json!([star(3, "ok/r")]));
        transport.serve(&format!("{ok_url}&prev_id=3"), json!([]));

        let report = controller(transport, Arc::clone(&gateway))
            .run(vec![
                entity("ok", EntityKind::Org, None),
                entity("missing", EntityKind::Org, None),
            ])
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.cursors.len(), 2);
    }
}
