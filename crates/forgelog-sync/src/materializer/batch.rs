//! In-memory accumulation of node and edge mutations for one archive file.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use forgelog_core::{Attributes, EdgeRecord, EdgeType, NodeKey, NodeRecord, NodeType};
use forgelog_storage::{EdgeUpsert, NodeUpsert};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
struct NodeEntry {
    /// Attribute value plus the event time that last wrote it.
    attributes: BTreeMap<String, (JsonValue, DateTime<Utc>)>,
    last_update: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct EdgeEntry {
    properties: Attributes,
    last_update: DateTime<Utc>,
}

type EdgeKey = (NodeKey, NodeKey, i64);

/// Last-write-wins accumulation maps keyed by node/edge identity.
///
/// A write whose event time is `>=` the recorded one wins, so among equal timestamps the
/// line processed last wins. Node attributes are merged per attribute; edge property bags are
/// replaced whole.
#[derive(Debug, Clone, Default)]
pub struct GraphBatch {
    nodes: BTreeMap<NodeType, BTreeMap<NodeKey, NodeEntry>>,
    edges: BTreeMap<EdgeType, BTreeMap<EdgeKey, EdgeEntry>>,
}

/// Upserts ready for the graph store, edges grouped by commit phase.
#[derive(Debug, Clone, Default)]
pub struct GraphExport {
    pub nodes: Vec<NodeUpsert>,
    pub edge_phases: BTreeMap<u8, Vec<EdgeUpsert>>,
    pub node_count: usize,
    pub edge_count: usize,
    pub skipped_edges: usize,
}

impl GraphBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_node(
        &mut self,
        node_type: NodeType,
        key: impl Into<NodeKey>,
        properties: Attributes,
        at: DateTime<Utc>,
    ) {
        let entry = self
            .nodes
            .entry(node_type)
            .or_default()
            .entry(key.into())
            .or_insert_with(|| NodeEntry {
                attributes: BTreeMap::new(),
                last_update: at,
            });
        if entry.last_update <= at {
            entry.last_update = at;
        }
        for (name, value) in properties {
            match entry.attributes.get(&name) {
                Some((_, recorded)) if *recorded > at => {}
                _ => {
                    entry.attributes.insert(name, (value, at));
                }
            }
        }
    }

    pub fn update_edge(
        &mut self,
        edge_type: EdgeType,
        from: impl Into<NodeKey>,
        to: impl Into<NodeKey>,
        id: i64,
        properties: Attributes,
        at: DateTime<Utc>,
    ) {
        let key = (from.into(), to.into(), id);
        let edges = self.edges.entry(edge_type).or_default();
        match edges.get_mut(&key) {
            Some(entry) if entry.last_update > at => {}
            Some(entry) => {
                entry.properties = properties;
                entry.last_update = at;
            }
            None => {
                edges.insert(
                    key,
                    EdgeEntry {
                        properties,
                        last_update: at,
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.values().all(BTreeMap::is_empty) && self.edges.values().all(BTreeMap::is_empty)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(BTreeMap::len).sum()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    pub fn node(&self, node_type: NodeType, key: &NodeKey) -> Option<Attributes> {
        self.nodes.get(&node_type)?.get(key).map(|entry| {
            entry
                .attributes
                .iter()
                .map(|(k, (v, _))| (k.clone(), v.clone()))
                .collect()
        })
    }

    pub fn edge(&self, edge_type: EdgeType, from: &NodeKey, to: &NodeKey, id: i64) -> Option<&Attributes> {
        self.edges
            .get(&edge_type)?
            .get(&(from.clone(), to.clone(), id))
            .map(|entry| &entry.properties)
    }

    pub fn edges_of(&self, edge_type: EdgeType) -> usize {
        self.edges.get(&edge_type).map_or(0, BTreeMap::len)
    }

    /// Converts the maps into chunked upserts, stamping export-time attributes.
    pub fn export(self, chunk_size: usize) -> GraphExport {
        let chunk_size = chunk_size.max(1);
        let mut out = GraphExport::default();

        for (node_type, entries) in self.nodes {
            let records: Vec<NodeRecord> = entries
                .into_iter()
                .map(|(key, entry)| export_node(node_type, key, entry))
                .collect();
            out.node_count += records.len();
            for chunk in records.chunks(chunk_size) {
                out.nodes.push(NodeUpsert {
                    node_type,
                    nodes: chunk.to_vec(),
                });
            }
        }

        for (edge_type, entries) in self.edges {
            let mut records = Vec::with_capacity(entries.len());
            for ((from, to, id), entry) in entries {
                if is_missing(&from) || is_missing(&to) {
                    out.skipped_edges += 1;
                    continue;
                }
                records.push(EdgeRecord {
                    from,
                    to,
                    id,
                    properties: entry.properties,
                });
            }
            out.edge_count += records.len();
            let phase = out.edge_phases.entry(edge_type.commit_phase()).or_default();
            for chunk in records.chunks(chunk_size) {
                phase.push(EdgeUpsert {
                    edge_type,
                    edges: chunk.to_vec(),
                });
            }
        }
        out
    }
}

fn is_missing(key: &NodeKey) -> bool {
    match key {
        NodeKey::Id(id) => *id == 0,
        NodeKey::Name(name) => name.is_empty(),
    }
}

fn export_node(node_type: NodeType, key: NodeKey, entry: NodeEntry) -> NodeRecord {
    let mut properties: Attributes = entry
        .attributes
        .into_iter()
        .map(|(k, (v, _))| (k, v))
        .collect();
    if node_type.tracks_update_time() {
        properties.insert(
            "__updated_at".into(),
            JsonValue::from(iso_millis(&entry.last_update)),
        );
    }
    match node_type {
        NodeType::GithubActor => {
            let is_bot = properties
                .get("login")
                .and_then(JsonValue::as_str)
                .is_some_and(|login| login.ends_with("[bot]"));
            if is_bot {
                properties.insert("is_bot".into(), JsonValue::Bool(true));
            }
        }
        NodeType::GithubRepo => {
            for field in ["created_at", "updated_at", "pushed_at"] {
                if let Some(iso) = properties.get(field).and_then(repo_time_iso) {
                    properties.insert(field.into(), JsonValue::from(iso));
                }
            }
        }
        _ => {}
    }
    NodeRecord { key, properties }
}

fn iso_millis(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Repo timestamps arrive as RFC 3339 text or, in older archives, as epoch seconds.
fn repo_time_iso(value: &JsonValue) -> Option<String> {
    let parsed = match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc),
        JsonValue::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single()?,
        _ => return None,
    };
    Some(iso_millis(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn attrs(value: JsonValue) -> Attributes {
        match value {
            JsonValue::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[test]
    fn newer_attribute_wins_regardless_of_arrival_order() {
        let mut a = GraphBatch::new();
        a.update_node(NodeType::GithubRepo, 1u64, attrs(json!({"name": "old"})), at(1));
        a.update_node(NodeType::GithubRepo, 1u64, attrs(json!({"name": "new"})), at(5));

        let mut b = GraphBatch::new();
        b.update_node(NodeType::GithubRepo, 1u64, attrs(json!({"name": "new"})), at(5));
        b.update_node(NodeType::GithubRepo, 1u64, attrs(json!({"name": "old", "description": "d"})), at(1));

        let key = NodeKey::Id(1);
        assert_eq!(a.node(NodeType::GithubRepo, &key).unwrap()["name"], json!("new"));
        let merged = b.node(NodeType::GithubRepo, &key).unwrap();
        assert_eq!(merged["name"], json!("new"));
        assert_eq!(merged["description"], json!("d"));
    }

    #[test]
    fn equal_timestamps_let_the_later_write_win() {
        let mut batch = GraphBatch::new();
        batch.update_edge(EdgeType::Action, 7u64, "1_2", 99, attrs(json!({"type": "close"})), at(3));
        batch.update_edge(
            EdgeType::Action,
            7u64,
            "1_2",
            99,
            attrs(json!({"type": "close", "merged": true})),
            at(3),
        );
        let edge = batch
            .edge(EdgeType::Action, &NodeKey::Id(7), &NodeKey::from("1_2"), 99)
            .unwrap();
        assert_eq!(edge["merged"], json!(true));

        batch.update_edge(EdgeType::Action, 7u64, "1_2", 99, attrs(json!({"type": "stale"})), at(2));
        let edge = batch
            .edge(EdgeType::Action, &NodeKey::Id(7), &NodeKey::from("1_2"), 99)
            .unwrap();
        assert_eq!(edge["type"], json!("close"));
    }

    #[test]
    fn export_stamps_nodes_and_skips_edges_without_endpoints() {
        let mut batch = GraphBatch::new();
        batch.update_node(NodeType::GithubActor, 5u64, attrs(json!({"login": "dependabot[bot]"})), at(0));
        batch.update_node(NodeType::GithubRepo, 9u64, attrs(json!({"pushed_at": 1_700_000_000})), at(0));
        batch.update_node(NodeType::Language, "Rust", Attributes::new(), at(0));
        batch.update_edge(EdgeType::HasLanguage, 9u64, "Rust", -1, Attributes::new(), at(0));
        batch.update_edge(EdgeType::HasLicense, 9u64, "", -1, Attributes::new(), at(0));
        batch.update_edge(EdgeType::Action, 5u64, "9_1", 3, Attributes::new(), at(0));

        let export = batch.export(1);
        assert_eq!(export.node_count, 3);
        assert_eq!(export.edge_count, 2);
        assert_eq!(export.skipped_edges, 1);

        let actor = export
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::GithubActor)
            .unwrap();
        assert_eq!(actor.nodes[0].properties["is_bot"], json!(true));
        assert_eq!(
            actor.nodes[0].properties["__updated_at"],
            json!("2024-05-01T10:00:00.000Z")
        );
        let repo = export
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::GithubRepo)
            .unwrap();
        assert_eq!(repo.nodes[0].properties["pushed_at"], json!("2023-11-14T22:13:20.000Z"));
        let language = export
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Language)
            .unwrap();
        assert!(!language.nodes[0].properties.contains_key("__updated_at"));

        assert_eq!(export.edge_phases[&0].len(), 1);
        assert_eq!(export.edge_phases[&1][0].edge_type, EdgeType::Action);
    }
}
