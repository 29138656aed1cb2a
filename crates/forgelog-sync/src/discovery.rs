//! Resolves the configured Gitee orgs and repos into tracked entities.
//!
//! Known entities live in a `ReplacingMergeTree` table. Missing ones are looked up on the API
//! once; orgs marked `split` are expanded into their repositories on every run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgelog_core::{escape_nested, flexible_u64, format_datetime, EntityKind, TrackedEntity};
use forgelog_storage::{
    ColumnarGateway, ExecutorOptions, FetchError, FetchTask, FetchedResponse, RequestExecutor,
    ResponseHandler, Row, TaskQueue, Transport,
};
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, warn};

use crate::config::TrackedEntitiesFile;
use crate::watermark::parse_store_time;

const REPOS_PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
enum DiscoveryTask {
    Lookup {
        name: String,
        kind: EntityKind,
        split: bool,
    },
    OrgRepos {
        org: String,
        page: usize,
    },
}

struct DiscoveryHandler {
    api_base: String,
    token: String,
    rows: Mutex<Vec<Row>>,
}

impl DiscoveryHandler {
    fn org_repos_url(&self, org: &str, page: usize) -> String {
        format!(
            "{}/orgs/{org}/repos?page={page}&per_page={REPOS_PER_PAGE}&access_token={}",
            self.api_base, self.token
        )
    }

    fn push_row(&self, row: JsonValue) {
        if let JsonValue::Object(row) = row {
            self.rows
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(row);
        }
    }

    fn take_rows(&self) -> Vec<Row> {
        std::mem::take(&mut *self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

fn entity_row(id: u64, name: &str, kind: EntityKind, split: bool, created_at: Option<&str>) -> JsonValue {
    let created_at = created_at
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| format_datetime(&t.with_timezone(&Utc)));
    json!({
        "id": id,
        "name": name,
        "type": kind.as_str(),
        "split": u8::from(split),
        "created_at": created_at,
    })
}

#[async_trait]
impl ResponseHandler<DiscoveryTask> for DiscoveryHandler {
    async fn on_response(
        &self,
        outcome: Result<FetchedResponse, FetchError>,
        task: FetchTask<DiscoveryTask>,
        queue: &TaskQueue<DiscoveryTask>,
    ) {
        let body = match outcome {
            Ok(response) => response.body,
            Err(err) => {
                warn!(task = ?task.user_data, error = %err, "discovery request failed");
                return;
            }
        };
        let data: JsonValue = match serde_json::from_slice(&body) {
            Ok(data) => data,
            Err(err) => {
                error!(task = ?task.user_data, error = %err, "error on parse orgs and repos");
                return;
            }
        };

        match task.user_data {
            DiscoveryTask::Lookup { name, kind, split } => {
                let Some(id) = data.get("id").and_then(flexible_u64).filter(|id| *id > 0) else {
                    info!(%name, kind = kind.as_str(), "entity not found on platform");
                    return;
                };
                let created_at = data.get("created_at").and_then(JsonValue::as_str);
                self.push_row(entity_row(id, &name, kind, split, created_at));
            }
            DiscoveryTask::OrgRepos { org, page } => {
                let Some(repos) = data.as_array() else {
                    info!(%org, page, "org repo listing is not an array");
                    return;
                };
                for repo in repos {
                    let (Some(id), Some(full_name)) = (
                        repo.get("id").and_then(flexible_u64),
                        repo.get("full_name").and_then(JsonValue::as_str),
                    ) else {
                        continue;
                    };
                    let created_at = repo.get("created_at").and_then(JsonValue::as_str);
                    self.push_row(entity_row(id, full_name, EntityKind::Repo, false, created_at));
                }
                if repos.len() == REPOS_PER_PAGE {
                    let next = page + 1;
                    queue.push(FetchTask::get(
                        self.org_repos_url(&org, next),
                        DiscoveryTask::OrgRepos { org, page: next },
                    ));
                }
            }
        }
    }
}

pub struct EntityDiscovery {
    gateway: Arc<dyn ColumnarGateway>,
    transport: Arc<dyn Transport>,
    table: String,
    api_base: String,
    token: String,
    batch_size: usize,
}

impl EntityDiscovery {
    pub fn new(
        gateway: Arc<dyn ColumnarGateway>,
        transport: Arc<dyn Transport>,
        table: impl Into<String>,
        api_base: impl Into<String>,
        token: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            gateway,
            transport,
            table: table.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            batch_size,
        }
    }

    fn executor(&self) -> RequestExecutor {
        RequestExecutor::new(
            Arc::clone(&self.transport),
            ExecutorOptions {
                batch_size: self.batch_size,
                retries: 0,
                retry_interval: Duration::from_millis(10),
            },
        )
    }

    fn handler(&self) -> Arc<DiscoveryHandler> {
        Arc::new(DiscoveryHandler {
            api_base: self.api_base.clone(),
            token: self.token.clone(),
            rows: Mutex::new(Vec::new()),
        })
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} \
             (`id` UInt64, `name` String, `type` Enum8('org' = 1, 'repo' = 2), `split` UInt8, \
             `created_at` Nullable(DateTime)) \
             ENGINE = ReplacingMergeTree ORDER BY (id, name, type)",
            self.table
        );
        self.gateway
            .command(&sql)
            .await
            .with_context(|| format!("creating {}", self.table))?;
        // Tables created before `created_at` existed lack the column.
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS `created_at` Nullable(DateTime)",
            self.table
        );
        self.gateway
            .command(&sql)
            .await
            .with_context(|| format!("adding created_at to {}", self.table))
    }

    pub async fn resolve(&self, tracked: &TrackedEntitiesFile) -> Result<Vec<TrackedEntity>> {
        self.ensure_table().await?;
        let known = self.known_names(tracked).await?;

        let mut lookups = Vec::new();
        for repo in tracked.repos.iter().filter(|r| !known.contains(r)) {
            lookups.push(FetchTask::get(
                format!("{}/repos/{repo}", self.api_base),
                DiscoveryTask::Lookup {
                    name: repo.clone(),
                    kind: EntityKind::Repo,
                    split: false,
                },
            ));
        }
        for org in tracked.orgs.iter().filter(|o| !known.contains(&o.name)) {
            lookups.push(FetchTask::get(
                format!("{}/orgs/{}", self.api_base, org.name),
                DiscoveryTask::Lookup {
                    name: org.name.clone(),
                    kind: EntityKind::Org,
                    split: org.split,
                },
            ));
        }
        if !lookups.is_empty() {
            info!(count = lookups.len(), "looking up new orgs and repos");
            let handler = self.handler();
            self.executor().drain(lookups, Arc::clone(&handler)).await;
            let rows = handler.take_rows();
            info!(count = rows.len(), "inserting discovered orgs and repos");
            self.gateway
                .insert(&self.table, rows)
                .await
                .context("inserting discovered orgs and repos")?;
        }

        let split_orgs = self
            .gateway
            .query(
                &format!("SELECT name FROM {} WHERE type = 'org' AND split = 1", self.table),
                &[],
            )
            .await
            .context("listing split orgs")?;
        let handler = self.handler();
        let listings: Vec<_> = split_orgs
            .iter()
            .filter_map(|row| row.first().and_then(JsonValue::as_str))
            .map(|org| {
                info!(org, "listing repositories of split org");
                FetchTask::get(
                    handler.org_repos_url(org, 1),
                    DiscoveryTask::OrgRepos {
                        org: org.to_string(),
                        page: 1,
                    },
                )
            })
            .collect();
        if !listings.is_empty() {
            self.executor().drain(listings, Arc::clone(&handler)).await;
            let rows = handler.take_rows();
            info!(count = rows.len(), "inserting repositories of split orgs");
            self.gateway
                .insert(&self.table, rows)
                .await
                .context("inserting split org repositories")?;
        }

        self.gateway
            .command(&format!("OPTIMIZE TABLE {} DEDUPLICATE", self.table))
            .await
            .context("deduplicating orgs and repos")?;
        let rows = self
            .gateway
            .query(
                &format!("SELECT name, type, created_at FROM {} WHERE split = 0", self.table),
                &[],
            )
            .await
            .context("listing tracked entities")?;

        let entities: Vec<TrackedEntity> = rows.iter().filter_map(|row| parse_entity(row)).collect();
        info!(
            orgs = entities.iter().filter(|e| e.kind == EntityKind::Org).count(),
            repos = entities.iter().filter(|e| e.kind == EntityKind::Repo).count(),
            "tracked entities resolved"
        );
        Ok(entities)
    }

    async fn known_names(&self, tracked: &TrackedEntitiesFile) -> Result<Vec<String>> {
        let names: Vec<&str> = tracked
            .repos
            .iter()
            .map(String::as_str)
            .chain(tracked.orgs.iter().map(|o| o.name.as_str()))
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let list = names
            .iter()
            .map(|n| format!("'{}'", escape_nested(n)))
            .collect::<Vec<_>>()
            .join(",");
        let rows = self
            .gateway
            .query(
                &format!("SELECT name FROM {} WHERE name IN {{names:Array(String)}}", self.table),
                &[("names", format!("[{list}]"))],
            )
            .await
            .context("reading known orgs and repos")?;
        Ok(rows
            .iter()
            .filter_map(|row| row.first().and_then(JsonValue::as_str).map(ToString::to_string))
            .collect())
    }
}

fn parse_entity(row: &[JsonValue]) -> Option<TrackedEntity> {
    let name = row.first()?.as_str()?;
    let kind = match row.get(1)?.as_str()? {
        "org" => EntityKind::Org,
        "repo" => EntityKind::Repo,
        other => {
            warn!(name, kind = other, "unexpected entity type");
            return None;
        }
    };
    Some(TrackedEntity {
        name: name.to_string(),
        kind,
        created_at: row.get(2).and_then(JsonValue::as_str).and_then(parse_store_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedOrg;
    use crate::testing::{CannedTransport, MemoryGateway};

    const BASE: &str = "https://gitee.test/api/v5";

    fn discovery(gateway: Arc<MemoryGateway>, transport: Arc<CannedTransport>) -> EntityDiscovery {
        EntityDiscovery::new(gateway, transport, "orgs_repos", BASE, "tok", 4)
    }

    #[tokio::test]
    async fn looks_up_only_unknown_entities_and_keeps_missing_ones_out() {
        let gateway = Arc::new(MemoryGateway::default());
        gateway.respond("WHERE name IN", vec![vec![json!("mindspore")]]);
        gateway.respond(
            "WHERE split = 0",
            vec![
                vec![json!("mindspore"), json!("org"), JsonValue::Null],
                vec![json!("openeuler/kernel"), json!("repo"), json!("2019-12-01 08:00:00")],
            ],
        );
        let transport = Arc::new(CannedTransport::default());
        transport.serve(
            &format!("{BASE}/repos/openeuler/kernel"),
            json!({"id": 77, "full_name": "openeuler/kernel", "created_at": "2019-12-01T16:00:00+08:00"}),
        );
        transport.serve(&format!("{BASE}/repos/gone/repo"), json!({"message": "Not Found"}));

        let tracked = TrackedEntitiesFile {
            orgs: vec![TrackedOrg {
                name: "mindspore".into(),
                split: false,
            }],
            repos: vec!["openeuler/kernel".into(), "gone/repo".into()],
        };
        let entities = discovery(Arc::clone(&gateway), Arc::clone(&transport))
            .resolve(&tracked)
            .await
            .unwrap();

        let requested = transport.requested.lock().unwrap().clone();
        assert_eq!(requested.len(), 2);
        assert!(!requested.iter().any(|u| u.ends_with("/orgs/mindspore")));

        let inserted = gateway.inserted("orgs_repos");
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0]["id"], json!(77));
        assert_eq!(inserted[0]["type"], json!("repo"));
        assert_eq!(inserted[0]["created_at"], json!("2019-12-01 08:00:00"));

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].kind, EntityKind::Org);
        assert!(entities[0].created_at.is_none());
        assert_eq!(
            entities[1].created_at.map(|t| t.to_rfc3339()),
            Some("2019-12-01T08:00:00+00:00".to_string())
        );
        let commands = gateway.commands.lock().unwrap().clone();
        assert!(commands[0].starts_with("CREATE TABLE IF NOT EXISTS orgs_repos"));
        assert_eq!(commands.last().unwrap(), "OPTIMIZE TABLE orgs_repos DEDUPLICATE");
    }

    #[tokio::test]
    async fn ensure_table_backfills_created_at_on_existing_tables() {
        let gateway = Arc::new(MemoryGateway::default());
        discovery(Arc::clone(&gateway), Arc::new(CannedTransport::default()))
            .ensure_table()
            .await
            .unwrap();

        let commands = gateway.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("CREATE TABLE IF NOT EXISTS orgs_repos"));
        assert_eq!(
            commands[1],
            "ALTER TABLE orgs_repos ADD COLUMN IF NOT EXISTS `created_at` Nullable(DateTime)"
        );
    }

    #[tokio::test]
    async fn split_orgs_are_paged_until_a_short_page() {
        let gateway = Arc::new(MemoryGateway::default());
        gateway.respond("split = 1", vec![vec![json!("openharmony")]]);
        let transport = Arc::new(CannedTransport::default());
        let full_page: Vec<JsonValue> = (0..REPOS_PER_PAGE)
            .map(|i| json!({"id": 1000 + i, "full_name": format!("openharmony/r{i}")}))
            .collect();
        transport.serve(
            &format!("{BASE}/orgs/openharmony/repos?page=1&per_page=100&access_token=tok"),
            JsonValue::Array(full_page),
        );
        transport.serve(
            &format!("{BASE}/orgs/openharmony/repos?page=2&per_page=100&access_token=tok"),
            json!([{"id": 5000, "full_name": "openharmony/last"}]),
        );

        discovery(Arc::clone(&gateway), Arc::clone(&transport))
            .resolve(&TrackedEntitiesFile::default())
            .await
            .unwrap();

        let inserted = gateway.inserted("orgs_repos");
        assert_eq!(inserted.len(), REPOS_PER_PAGE + 1);
        assert!(inserted.iter().all(|r| r["type"] == json!("repo") && r["split"] == json!(0)));
        assert_eq!(transport.requested.lock().unwrap().len(), 2);
    }
}
