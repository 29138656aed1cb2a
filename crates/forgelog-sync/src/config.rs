//! Environment-driven runtime configuration and the tracked-entities file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use forgelog_storage::{ClickHouseConfig, ExecutorOptions, HttpClientConfig, Neo4jConfig, RateLimit};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub clickhouse_url: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub clickhouse_database: String,
    pub event_table: String,
    pub orgs_repos_table: String,

    pub gitee_api_base: String,
    pub gitee_token: String,
    pub tracked_entities_file: PathBuf,

    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,
    pub neo4j_max_connections: usize,

    pub data_dir: PathBuf,
    pub archive_base_url: String,
    pub download_enabled: bool,
    pub download_lookback_hours: i64,
    pub downloader_workers: usize,
    pub downloader_timeout_secs: u64,

    pub scheduler_enabled: bool,
    pub gitee_cron: String,
    pub log_import_cron: String,

    pub backfill_threshold_days: i64,
    pub executor_batch_size: usize,
    pub executor_retries: usize,
    pub executor_retry_interval_ms: u64,
    pub graph_chunk_size: usize,

    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub clickhouse_timeout_secs: u64,
    /// Request starts per minute against the forge APIs; 0 disables limiting.
    pub requests_per_minute: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            clickhouse_url: env_or("CLICKHOUSE_URL", "http://localhost:8123"),
            clickhouse_user: env_or("CLICKHOUSE_USER", "default"),
            clickhouse_password: env_or("CLICKHOUSE_PASSWORD", ""),
            clickhouse_database: env_or("CLICKHOUSE_DATABASE", "github_log"),
            event_table: env_or("CLICKHOUSE_EVENT_TABLE", "events"),
            orgs_repos_table: env_or("GITEE_ORGS_REPOS_TABLE", "gitee_orgs_repos"),

            gitee_api_base: env_or("GITEE_API_BASE", "https://gitee.com/api/v5"),
            gitee_token: env_or("GITEE_TOKEN", ""),
            tracked_entities_file: PathBuf::from(env_or("FORGELOG_TRACKED_FILE", "tracked.yaml")),

            neo4j_uri: env_or("NEO4J_URI", "bolt://localhost:7687"),
            neo4j_user: env_or("NEO4J_USER", "neo4j"),
            neo4j_password: env_or("NEO4J_PASSWORD", "neo4j"),
            neo4j_database: env_or("NEO4J_DATABASE", "neo4j"),
            neo4j_max_connections: env_parse("NEO4J_MAX_CONNECTIONS", 16),

            data_dir: PathBuf::from(env_or("DATA_DIR", "GHA_DATA")),
            archive_base_url: env_or("ARCHIVE_BASE_URL", "https://data.gharchive.org/"),
            download_enabled: env_flag("FORGELOG_DOWNLOAD_ENABLED", true),
            download_lookback_hours: env_parse("DOWNLOAD_LOOKBACK_HOURS", 24),
            downloader_workers: env_parse("DOWNLOADER_NUM", 3),
            downloader_timeout_secs: env_parse("DOWNLOADER_TIMEOUT_SECS", 300),

            scheduler_enabled: env_flag("FORGELOG_SCHEDULER_ENABLED", false),
            gitee_cron: env_or("GITEE_SYNC_CRON", "0 0 0 */3 * *"),
            log_import_cron: env_or("LOG_IMPORT_CRON", "0 0 */1 * * *"),

            backfill_threshold_days: env_parse("BACKFILL_THRESHOLD_DAYS", 3),
            executor_batch_size: env_parse("EXECUTOR_BATCH_SIZE", 30),
            executor_retries: env_parse("EXECUTOR_RETRIES", 3),
            executor_retry_interval_ms: env_parse("EXECUTOR_RETRY_INTERVAL_MS", 1000),
            graph_chunk_size: env_parse("GRAPH_CHUNK_SIZE", 50_000),

            user_agent: env_or("FORGELOG_USER_AGENT", "forgelog/0.1"),
            http_timeout_secs: env_parse("FORGELOG_HTTP_TIMEOUT_SECS", 30),
            clickhouse_timeout_secs: env_parse("CLICKHOUSE_TIMEOUT_SECS", 600),
            requests_per_minute: env_parse("FORGELOG_REQUESTS_PER_MINUTE", 0),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Some(Duration::from_secs(self.http_timeout_secs)),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: (self.requests_per_minute > 0).then(|| RateLimit {
                requests: self.requests_per_minute,
                window: Duration::from_secs(60),
            }),
            ..Default::default()
        }
    }

    /// Client settings for ClickHouse; merges and bulk inserts outlast API calls.
    pub fn clickhouse_http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Some(Duration::from_secs(self.clickhouse_timeout_secs)),
            rate_limit: None,
            ..self.http_client()
        }
    }

    pub fn clickhouse(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.clickhouse_url.clone(),
            user: self.clickhouse_user.clone(),
            password: self.clickhouse_password.clone(),
            database: self.clickhouse_database.clone(),
        }
    }

    pub fn neo4j(&self) -> Neo4jConfig {
        Neo4jConfig {
            uri: self.neo4j_uri.clone(),
            user: self.neo4j_user.clone(),
            password: self.neo4j_password.clone(),
            database: self.neo4j_database.clone(),
            max_connections: self.neo4j_max_connections,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn executor(&self) -> ExecutorOptions {
        ExecutorOptions {
            batch_size: self.executor_batch_size,
            retries: self.executor_retries,
            retry_interval: Duration::from_millis(self.executor_retry_interval_ms),
        }
    }

    pub fn backfill_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.backfill_threshold_days)
    }
}

/// Organizations and repositories to follow, as listed in the tracked-entities YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TrackedEntitiesFile {
    #[serde(default)]
    pub orgs: Vec<TrackedOrg>,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackedOrg {
    pub name: String,
    /// Follow each repository of the org individually instead of the org feed.
    #[serde(default)]
    pub split: bool,
}

impl TrackedEntitiesFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn tracked_file_defaults_split_and_empty_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracked.yaml");
        std::fs::write(
            &path,
            "orgs:\n  - name: openharmony\n    split: true\n  - name: mindspore\n",
        )
        .unwrap();

        let tracked = TrackedEntitiesFile::load(&path).await.unwrap();
        assert_eq!(tracked.orgs.len(), 2);
        assert!(tracked.orgs[0].split);
        assert!(!tracked.orgs[1].split);
        assert!(tracked.repos.is_empty());
    }

    #[tokio::test]
    async fn missing_tracked_file_names_the_path() {
        let err = TrackedEntitiesFile::load(Path::new("/nonexistent/tracked.yaml"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tracked.yaml"));
    }

    #[test]
    fn executor_options_follow_config() {
        let mut config = AppConfig::from_env();
        config.executor_batch_size = 7;
        config.executor_retry_interval_ms = 250;
        let options = config.executor();
        assert_eq!(options.batch_size, 7);
        assert_eq!(options.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn clickhouse_client_has_its_own_deadline() {
        let mut config = AppConfig::from_env();
        config.http_timeout_secs = 30;
        config.clickhouse_timeout_secs = 600;
        config.requests_per_minute = 60;
        let http = config.clickhouse_http();
        assert_eq!(http.timeout, Some(Duration::from_secs(600)));
        assert!(http.rate_limit.is_none());
    }

    #[test]
    fn rate_limit_is_off_unless_configured() {
        let mut config = AppConfig::from_env();
        config.requests_per_minute = 0;
        assert!(config.http_client().rate_limit.is_none());
        config.requests_per_minute = 120;
        let limit = config.http_client().rate_limit.unwrap();
        assert_eq!(limit.requests, 120);
        assert_eq!(limit.window, Duration::from_secs(60));
    }
}
