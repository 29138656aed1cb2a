//! Property-graph gateway and its Neo4j implementation.

use std::time::Duration;

use async_trait::async_trait;
use forgelog_core::{EdgeRecord, EdgeType, NodeRecord, NodeType};
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString,
    BoltType, ConfigBuilder, Graph,
};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),
    #[error("neo4j connect timeout after {0:?}")]
    ConnectTimeout(Duration),
}

/// One chunk of nodes of a single type.
#[derive(Debug, Clone)]
pub struct NodeUpsert {
    pub node_type: NodeType,
    pub nodes: Vec<NodeRecord>,
}

/// One chunk of edges of a single type.
#[derive(Debug, Clone)]
pub struct EdgeUpsert {
    pub edge_type: EdgeType,
    pub edges: Vec<EdgeRecord>,
}

#[async_trait]
pub trait GraphGateway: Send + Sync {
    async fn upsert_nodes(&self, batch: NodeUpsert) -> Result<(), GraphStoreError>;
    async fn upsert_edges(&self, batch: EdgeUpsert) -> Result<(), GraphStoreError>;
    /// Deletes every node and (re)creates key constraints. Destructive.
    async fn reset_schema(&self) -> Result<(), GraphStoreError>;
}

#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(cfg: &Neo4jConfig) -> Result<Self, GraphStoreError> {
        let config = ConfigBuilder::default()
            .uri(cfg.uri.clone())
            .user(cfg.user.clone())
            .password(cfg.password.clone())
            .db(cfg.database.clone())
            .max_connections(cfg.max_connections)
            .build()?;

        let graph = match tokio::time::timeout(cfg.connect_timeout, Graph::connect(config)).await {
            Ok(r) => r?,
            Err(_) => return Err(GraphStoreError::ConnectTimeout(cfg.connect_timeout)),
        };
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphGateway for Neo4jGraphStore {
    async fn upsert_nodes(&self, batch: NodeUpsert) -> Result<(), GraphStoreError> {
        if batch.nodes.is_empty() {
            return Ok(());
        }
        let rows: Vec<JsonValue> = batch
            .nodes
            .iter()
            .map(|n| json!({ "key": n.key.to_json(), "properties": n.properties }))
            .collect();
        let q = query(&node_upsert_cypher(batch.node_type))
            .param("nodes", json_to_bolt(&JsonValue::Array(rows)));
        self.graph.run(q).await?;
        debug!(label = batch.node_type.label(), count = batch.nodes.len(), "nodes upserted");
        Ok(())
    }

    async fn upsert_edges(&self, batch: EdgeUpsert) -> Result<(), GraphStoreError> {
        if batch.edges.is_empty() {
            return Ok(());
        }
        let rows: Vec<JsonValue> = batch
            .edges
            .iter()
            .map(|e| {
                json!({
                    "from": e.from.to_json(),
                    "to": e.to.to_json(),
                    "id": e.id,
                    "properties": e.properties,
                })
            })
            .collect();
        let q = query(&edge_upsert_cypher(batch.edge_type))
            .param("edges", json_to_bolt(&JsonValue::Array(rows)));
        self.graph.run(q).await?;
        debug!(label = batch.edge_type.label(), count = batch.edges.len(), "edges upserted");
        Ok(())
    }

    async fn reset_schema(&self) -> Result<(), GraphStoreError> {
        for statement in schema_statements() {
            self.graph.run(query(&statement)).await?;
        }
        info!("graph schema reset");
        Ok(())
    }
}

pub fn node_upsert_cypher(node_type: NodeType) -> String {
    let label = node_type.label();
    let pk = node_type.primary_key();
    format!("UNWIND $nodes AS node MERGE (n:{label} {{{pk}: node.key}}) SET n += node.properties")
}

pub fn edge_upsert_cypher(edge_type: EdgeType) -> String {
    let (from, to) = edge_type.endpoints();
    let rel = if edge_type.keyed_by_event() {
        format!("{} {{id: edge.id}}", edge_type.label())
    } else {
        edge_type.label().to_string()
    };
    format!(
        "UNWIND $edges AS edge \
         MATCH (from:{} {{{}: edge.from}}), (to:{} {{{}: edge.to}}) \
         MERGE (from)-[e:{rel}]->(to) SET e += edge.properties",
        from.label(),
        from.primary_key(),
        to.label(),
        to.primary_key(),
    )
}

/// Statements run by `reset_schema`, in order.
pub fn schema_statements() -> Vec<String> {
    let mut out = vec!["MATCH (n) DETACH DELETE n".to_string()];
    for node_type in NodeType::ALL {
        let label = node_type.label();
        let pk = node_type.primary_key();
        out.push(format!(
            "CREATE CONSTRAINT {label}_{pk}_unique IF NOT EXISTS FOR (n:{label}) REQUIRE n.{pk} IS UNIQUE"
        ));
    }
    for edge_type in EdgeType::ALL.into_iter().filter(EdgeType::keyed_by_event) {
        let label = edge_type.label();
        out.push(format!(
            "CREATE CONSTRAINT {label}_id_unique IF NOT EXISTS FOR ()-[r:{label}]-() REQUIRE r.id IS UNIQUE"
        ));
    }
    out
}

fn json_to_bolt(value: &JsonValue) -> BoltType {
    match value {
        JsonValue::Null => BoltType::Null(BoltNull),
        JsonValue::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                BoltType::Integer(BoltInteger::new(i))
            } else {
                BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or(0.0)))
            }
        }
        JsonValue::String(s) => BoltType::String(BoltString::from(s.as_str())),
        JsonValue::Array(arr) => {
            let list = arr.iter().map(json_to_bolt).collect::<Vec<_>>();
            BoltType::List(BoltList::from(list))
        }
        JsonValue::Object(obj) => {
            let map: BoltMap = obj
                .iter()
                .map(|(k, v)| (BoltString::from(k.as_str()), json_to_bolt(v)))
                .collect();
            BoltType::Map(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_merge_uses_the_type_primary_key() {
        assert_eq!(
            node_upsert_cypher(NodeType::License),
            "UNWIND $nodes AS node MERGE (n:license {spdx_id: node.key}) SET n += node.properties"
        );
    }

    #[test]
    fn event_keyed_edges_merge_on_edge_id() {
        let action = edge_upsert_cypher(EdgeType::Action);
        assert!(action.contains("MATCH (from:github_actor {id: edge.from})"));
        assert!(action.contains("(to:github_issue_change_request {id: edge.to})"));
        assert!(action.contains("MERGE (from)-[e:action {id: edge.id}]->(to)"));

        let star = edge_upsert_cypher(EdgeType::Star);
        assert!(star.contains("MERGE (from)-[e:star]->(to)"));
    }

    #[test]
    fn schema_reset_wipes_then_constrains_every_node_type() {
        let statements = schema_statements();
        assert_eq!(statements[0], "MATCH (n) DETACH DELETE n");
        assert_eq!(statements.len(), 1 + NodeType::ALL.len() + 2);
        assert!(statements
            .iter()
            .any(|s| s.contains("FOR (n:issue_label) REQUIRE n.name IS UNIQUE")));
        assert!(statements
            .iter()
            .any(|s| s.contains("FOR ()-[r:action]-() REQUIRE r.id IS UNIQUE")));
    }

    #[test]
    fn json_numbers_map_to_bolt_integers() {
        assert!(matches!(json_to_bolt(&json!(42)), BoltType::Integer(_)));
        assert!(matches!(json_to_bolt(&json!(1.5)), BoltType::Float(_)));
        assert!(matches!(json_to_bolt(&json!({"a": [1]})), BoltType::Map(_)));
    }
}
