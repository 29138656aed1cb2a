//! In-memory gateways and a canned transport shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use forgelog_core::EdgeType;
use forgelog_storage::{
    RetryPolicy, ColumnarGateway, EdgeUpsert, FetchError, FetchedResponse, GatewayError,
    GraphGateway, GraphStoreError, NodeUpsert, Row, Transport,
};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;

#[derive(Default)]
pub(crate) struct MemoryGateway {
    /// `(sql fragment, rows)`: the first fragment contained in a query answers it.
    pub responses: Mutex<Vec<(String, Vec<Vec<JsonValue>>)>>,
    pub queries: Mutex<Vec<String>>,
    pub inserts: Mutex<Vec<(String, Vec<Row>)>>,
    pub commands: Mutex<Vec<String>>,
}

impl MemoryGateway {
    pub fn respond(&self, fragment: &str, rows: Vec<Vec<JsonValue>>) {
        self.responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), rows));
    }

    pub fn inserted(&self, table: &str) -> Vec<Row> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .flat_map(|(_, rows)| rows.clone())
            .collect()
    }
}

#[async_trait]
impl ColumnarGateway for MemoryGateway {
    async fn query(
        &self,
        sql: &str,
        _params: &[(&str, String)],
    ) -> Result<Vec<Vec<JsonValue>>, GatewayError> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<(), GatewayError> {
        if !rows.is_empty() {
            self.inserts.lock().unwrap().push((table.to_string(), rows));
        }
        Ok(())
    }

    async fn command(&self, sql: &str) -> Result<(), GatewayError> {
        self.commands.lock().unwrap().push(sql.to_string());
        Ok(())
    }
}

/// Serves fixed bodies by exact URL; anything else is a 404.
#[derive(Default)]
pub(crate) struct CannedTransport {
    pub bodies: Mutex<HashMap<String, String>>,
    pub requested: Mutex<Vec<String>>,
}

impl CannedTransport {
    pub fn serve(&self, url: &str, body: JsonValue) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }
}

#[async_trait]
impl Transport for CannedTransport {
    async fn execute(
        &self,
        _method: Method,
        url: &str,
        _policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        match self.bodies.lock().unwrap().get(url) {
            Some(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: body.clone().into_bytes(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum GraphCall {
    Nodes(NodeUpsert),
    Edges(EdgeUpsert),
    Reset,
}

#[derive(Default)]
pub(crate) struct RecordingGraph {
    pub calls: Mutex<Vec<GraphCall>>,
    pub fail_edges: Option<EdgeType>,
}

impl RecordingGraph {
    pub fn edge_calls(&self) -> Vec<EdgeUpsert> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                GraphCall::Edges(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn node_calls(&self) -> Vec<NodeUpsert> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                GraphCall::Nodes(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GraphGateway for RecordingGraph {
    async fn upsert_nodes(&self, batch: NodeUpsert) -> Result<(), GraphStoreError> {
        self.calls.lock().unwrap().push(GraphCall::Nodes(batch));
        Ok(())
    }

    async fn upsert_edges(&self, batch: EdgeUpsert) -> Result<(), GraphStoreError> {
        if self.fail_edges == Some(batch.edge_type) {
            return Err(GraphStoreError::ConnectTimeout(std::time::Duration::from_secs(1)));
        }
        self.calls.lock().unwrap().push(GraphCall::Edges(batch));
        Ok(())
    }

    async fn reset_schema(&self) -> Result<(), GraphStoreError> {
        self.calls.lock().unwrap().push(GraphCall::Reset);
        Ok(())
    }
}
