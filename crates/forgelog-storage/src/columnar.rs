//! Columnar event store gateway. The production implementation speaks ClickHouse's HTTP interface.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub type Row = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("columnar store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("columnar store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable columnar store response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ColumnarGateway: Send + Sync {
    /// Runs a read query; each row comes back as positional column values.
    async fn query(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Vec<JsonValue>>, GatewayError>;

    /// Appends rows to `table`. An empty batch is a no-op.
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<(), GatewayError>;

    /// Runs a statement with no result set (DDL, OPTIMIZE).
    async fn command(&self, sql: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct ClickHouseGateway {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseGateway {
    pub fn new(client: reqwest::Client, config: ClickHouseConfig) -> Self {
        Self { client, config }
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    async fn post(
        &self,
        query_params: Vec<(String, String)>,
        body: String,
    ) -> Result<String, GatewayError> {
        let resp = self
            .client
            .post(&self.config.url)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .header("X-ClickHouse-Database", &self.config.database)
            .query(&query_params)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl ColumnarGateway for ClickHouseGateway {
    async fn query(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Vec<JsonValue>>, GatewayError> {
        let query_params = params
            .iter()
            .map(|(name, value)| (format!("param_{name}"), value.clone()))
            .collect();
        let body = format!("{} FORMAT JSONCompactEachRow", sql.trim_end().trim_end_matches(';'));
        let text = self.post(query_params, body).await?;
        decode_compact_rows(&text)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<(), GatewayError> {
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        let query_params = vec![
            (
                "query".to_string(),
                format!("INSERT INTO {table} FORMAT JSONEachRow"),
            ),
            ("date_time_input_format".to_string(), "best_effort".to_string()),
        ];
        self.post(query_params, encode_rows(&rows)?).await?;
        debug!(table, rows = count, "inserted rows");
        Ok(())
    }

    async fn command(&self, sql: &str) -> Result<(), GatewayError> {
        self.post(Vec::new(), sql.to_string()).await?;
        Ok(())
    }
}

/// Newline-delimited JSON body for `FORMAT JSONEachRow`.
pub fn encode_rows(rows: &[Row]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_compact_rows(text: &str) -> Result<Vec<Vec<JsonValue>>, GatewayError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Vec<JsonValue>>(line).map_err(GatewayError::from))
        .collect()
}
