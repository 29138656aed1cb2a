//! Property-graph vocabulary shared by the materializer and the graph store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub type Attributes = Map<String, JsonValue>;

/// Edge id used by edge types that keep at most one edge per node pair.
pub const SENTINEL_EDGE_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    GithubRepo,
    GithubOrg,
    GithubActor,
    GithubIssueChangeRequest,
    IssueLabel,
    Language,
    License,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        NodeType::GithubRepo,
        NodeType::GithubOrg,
        NodeType::GithubActor,
        NodeType::GithubIssueChangeRequest,
        NodeType::IssueLabel,
        NodeType::Language,
        NodeType::License,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            NodeType::GithubRepo => "github_repo",
            NodeType::GithubOrg => "github_org",
            NodeType::GithubActor => "github_actor",
            NodeType::GithubIssueChangeRequest => "github_issue_change_request",
            NodeType::IssueLabel => "issue_label",
            NodeType::Language => "language",
            NodeType::License => "license",
        }
    }

    pub fn primary_key(&self) -> &'static str {
        match self {
            NodeType::IssueLabel | NodeType::Language => "name",
            NodeType::License => "spdx_id",
            _ => "id",
        }
    }

    /// Node types stamped with `__updated_at` on export.
    pub fn tracks_update_time(&self) -> bool {
        matches!(
            self,
            NodeType::GithubRepo
                | NodeType::GithubOrg
                | NodeType::GithubActor
                | NodeType::GithubIssueChangeRequest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    HasLicense,
    HasLanguage,
    HasRepo,
    HasFork,
    Star,
    Fork,
    HasIssueChangeRequest,
    HasIssueLabel,
    HasAssignee,
    HasRequestedReviewer,
    Action,
}

impl EdgeType {
    pub const ALL: [EdgeType; 11] = [
        EdgeType::HasLicense,
        EdgeType::HasLanguage,
        EdgeType::HasRepo,
        EdgeType::HasFork,
        EdgeType::Star,
        EdgeType::Fork,
        EdgeType::HasIssueChangeRequest,
        EdgeType::HasIssueLabel,
        EdgeType::HasAssignee,
        EdgeType::HasRequestedReviewer,
        EdgeType::Action,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EdgeType::HasLicense => "has_license",
            EdgeType::HasLanguage => "has_language",
            EdgeType::HasRepo => "has_repo",
            EdgeType::HasFork => "has_fork",
            EdgeType::Star => "star",
            EdgeType::Fork => "fork",
            EdgeType::HasIssueChangeRequest => "has_issue_change_request",
            EdgeType::HasIssueLabel => "has_issue_label",
            EdgeType::HasAssignee => "has_assignee",
            EdgeType::HasRequestedReviewer => "has_requested_reviewer",
            EdgeType::Action => "action",
        }
    }

    pub fn endpoints(&self) -> (NodeType, NodeType) {
        use NodeType::*;
        match self {
            EdgeType::HasLicense => (GithubRepo, License),
            EdgeType::HasLanguage => (GithubRepo, Language),
            EdgeType::HasRepo => (GithubOrg, GithubRepo),
            EdgeType::HasFork => (GithubRepo, GithubRepo),
            EdgeType::Star | EdgeType::Fork => (GithubActor, GithubRepo),
            EdgeType::HasIssueChangeRequest => (GithubRepo, GithubIssueChangeRequest),
            EdgeType::HasIssueLabel => (GithubIssueChangeRequest, IssueLabel),
            EdgeType::HasAssignee | EdgeType::HasRequestedReviewer => {
                (GithubIssueChangeRequest, GithubActor)
            }
            EdgeType::Action => (GithubActor, GithubIssueChangeRequest),
        }
    }

    /// Edge types keyed by the originating event id keep one edge per event.
    pub fn keyed_by_event(&self) -> bool {
        matches!(self, EdgeType::Action | EdgeType::Fork)
    }

    /// Commit ordering: phase 1 edges hang off issue/change-request nodes that phase 0 links in.
    pub fn commit_phase(&self) -> u8 {
        match self {
            EdgeType::HasIssueLabel
            | EdgeType::HasAssignee
            | EdgeType::HasRequestedReviewer
            | EdgeType::Action => 1,
            _ => 0,
        }
    }
}

/// Node primary key: platform numeric id or a natural key (label name, spdx id, `repo_number`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKey {
    Id(u64),
    Name(String),
}

impl NodeKey {
    pub fn to_json(&self) -> JsonValue {
        match self {
            NodeKey::Id(id) => JsonValue::from(*id),
            NodeKey::Name(name) => JsonValue::from(name.as_str()),
        }
    }
}

impl From<u64> for NodeKey {
    fn from(value: u64) -> Self {
        NodeKey::Id(value)
    }
}

impl From<&str> for NodeKey {
    fn from(value: &str) -> Self {
        NodeKey::Name(value.to_string())
    }
}

impl From<String> for NodeKey {
    fn from(value: String) -> Self {
        NodeKey::Name(value)
    }
}

/// Flushed node row handed to the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub properties: Attributes,
}

/// Flushed edge row handed to the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: NodeKey,
    pub to: NodeKey,
    pub id: i64,
    pub properties: Attributes,
}
