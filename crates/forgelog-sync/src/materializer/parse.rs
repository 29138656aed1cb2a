//! GitHub archive lines to graph mutations.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use forgelog_core::{flexible_u64, Attributes, EdgeType, NodeType, RawEvent, SENTINEL_EDGE_ID};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

use super::batch::GraphBatch;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub skipped: usize,
}

/// Reads a plain or gzip-compressed NDJSON file into a fresh batch; bad lines are logged and skipped.
pub fn parse_file(path: &Path) -> io::Result<(GraphBatch, ParseStats)> {
    let mut reader = BufReader::new(File::open(path)?);
    let gzipped = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    let reader: Box<dyn BufRead> = if gzipped {
        Box::new(BufReader::new(MultiGzDecoder::new(reader)))
    } else {
        Box::new(reader)
    };
    parse_reader(reader)
}

pub fn parse_reader<R: Read>(reader: R) -> io::Result<(GraphBatch, ParseStats)> {
    let mut batch = GraphBatch::new();
    let mut stats = ParseStats::default();
    for raw in BufReader::new(reader).split(b'\n') {
        let raw = raw?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        stats.lines += 1;
        let applied = std::str::from_utf8(&raw)
            .map_err(LineError::from)
            .and_then(|line| apply_line(&mut batch, line));
        if let Err(err) = applied {
            stats.skipped += 1;
            warn!(error = %err, line = %String::from_utf8_lossy(&raw), "error on parse line");
        }
    }
    Ok((batch, stats))
}

fn str_at<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key).and_then(JsonValue::as_str)
}

fn u64_at(value: &JsonValue, key: &str) -> Option<u64> {
    value.get(key).and_then(flexible_u64)
}

fn present(value: &JsonValue, key: &str) -> bool {
    value.get(key).is_some_and(|v| !v.is_null())
}

fn attrs(value: JsonValue) -> Attributes {
    match value {
        JsonValue::Object(map) => map,
        _ => Attributes::new(),
    }
}

struct LineContext<'a> {
    batch: &'a mut GraphBatch,
    event_id: i64,
    actor_id: u64,
    repo_id: u64,
    action: Option<String>,
    at: DateTime<Utc>,
}

impl LineContext<'_> {
    fn timestamp(&self) -> i64 {
        self.at.timestamp_millis()
    }

    fn action_edge(&mut self, issue_key: &str, mut properties: Attributes) {
        properties.insert("timestamp".into(), json!(self.timestamp()));
        self.batch.update_edge(
            EdgeType::Action,
            self.actor_id,
            issue_key,
            self.event_id,
            properties,
            self.at,
        );
    }

    fn actor(&mut self, user: &JsonValue) -> Option<u64> {
        let id = u64_at(user, "id")?;
        let login = str_at(user, "login").unwrap_or_default();
        self.batch
            .update_node(NodeType::GithubActor, id, attrs(json!({ "login": login })), self.at);
        Some(id)
    }

    /// Issue or change-request node plus labels, assignees and the open/close action edge.
    fn issue(&mut self, payload: &JsonValue) -> Result<(String, JsonValue), LineError> {
        let (issue, mut is_pull) = match payload.get("issue").filter(|v| !v.is_null()) {
            Some(issue) => (issue.clone(), false),
            None => (
                payload
                    .get("pull_request")
                    .filter(|v| !v.is_null())
                    .cloned()
                    .ok_or(LineError::MissingField("payload.issue"))?,
                true,
            ),
        };
        if present(&issue, "pull_request") {
            is_pull = true;
        }
        let number = u64_at(&issue, "number").ok_or(LineError::MissingField("issue.number"))?;
        let key = format!("{}_{number}", self.repo_id);

        self.batch.update_node(
            NodeType::GithubIssueChangeRequest,
            key.as_str(),
            attrs(json!({
                "type": if is_pull { "change_request" } else { "issue" },
                "number": number,
                "title": issue.get("title").cloned().unwrap_or(JsonValue::Null),
                "body": str_at(&issue, "body").unwrap_or_default(),
            })),
            self.at,
        );

        for label in issue.get("labels").and_then(JsonValue::as_array).into_iter().flatten() {
            let Some(name) = str_at(label, "name") else {
                continue;
            };
            self.batch
                .update_node(NodeType::IssueLabel, name, Attributes::new(), self.at);
            self.batch.update_edge(
                EdgeType::HasIssueLabel,
                key.as_str(),
                name,
                SENTINEL_EDGE_ID,
                Attributes::new(),
                self.at,
            );
        }

        let assignees = issue
            .get("assignee")
            .filter(|v| !v.is_null())
            .into_iter()
            .chain(issue.get("assignees").and_then(JsonValue::as_array).into_iter().flatten());
        for assignee in assignees {
            if let Some(id) = self.actor(assignee) {
                self.batch.update_edge(
                    EdgeType::HasAssignee,
                    key.as_str(),
                    id,
                    SENTINEL_EDGE_ID,
                    Attributes::new(),
                    self.at,
                );
            }
        }

        self.batch.update_edge(
            EdgeType::HasIssueChangeRequest,
            self.repo_id,
            key.as_str(),
            SENTINEL_EDGE_ID,
            Attributes::new(),
            self.at,
        );

        match self.action.as_deref() {
            Some("opened") => self.action_edge(&key, attrs(json!({"type": "open"}))),
            Some("closed") => self.action_edge(&key, attrs(json!({"type": "close"}))),
            _ => {}
        }
        Ok((key, issue))
    }

    fn pull(&mut self, payload: &JsonValue) -> Result<String, LineError> {
        let (key, pull) = self.issue(payload)?;

        if self.action.as_deref() == Some("closed") {
            let merged = pull.get("merged").and_then(JsonValue::as_bool).unwrap_or(false);
            self.action_edge(&key, attrs(json!({"type": "close", "merged": merged})));
        }

        let stats = ["commits", "additions", "deletions", "changed_files"]
            .map(|field| u64_at(&pull, field).unwrap_or(0));
        if stats.iter().any(|n| *n > 0) {
            self.batch.update_node(
                NodeType::GithubIssueChangeRequest,
                key.as_str(),
                attrs(json!({
                    "type": "change_request",
                    "commits": stats[0],
                    "additions": stats[1],
                    "deletions": stats[2],
                    "changed_files": stats[3],
                })),
                self.at,
            );
        }

        for reviewer in pull
            .get("requested_reviewers")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(id) = self.actor(reviewer) {
                self.batch.update_edge(
                    EdgeType::HasRequestedReviewer,
                    key.as_str(),
                    id,
                    SENTINEL_EDGE_ID,
                    Attributes::new(),
                    self.at,
                );
            }
        }

        let base = pull.get("base").cloned().unwrap_or(JsonValue::Null);
        if let Some(repo) = base.get("repo").filter(|v| !v.is_null()) {
            self.base_repo(repo);
        }
        if present(&base, "ref") && present(&base, "sha") {
            self.batch.update_node(
                NodeType::GithubIssueChangeRequest,
                key.as_str(),
                attrs(json!({"base_ref": base["ref"], "type": "change_request"})),
                self.at,
            );
        }
        let head = pull.get("head").cloned().unwrap_or(JsonValue::Null);
        if present(&head, "ref") && present(&head, "sha") && present(&head, "repo") {
            self.batch.update_node(
                NodeType::GithubIssueChangeRequest,
                key.as_str(),
                attrs(json!({
                    "head_id": head["repo"].get("id").cloned().unwrap_or(JsonValue::Null),
                    "head_name": head["repo"].get("full_name").cloned().unwrap_or(JsonValue::Null),
                    "head_ref": head["ref"],
                    "type": "change_request",
                })),
                self.at,
            );
        }
        Ok(key)
    }

    fn base_repo(&mut self, repo: &JsonValue) {
        if let Some(language) = str_at(repo, "language") {
            self.batch
                .update_node(NodeType::Language, language, Attributes::new(), self.at);
            self.batch.update_edge(
                EdgeType::HasLanguage,
                self.repo_id,
                language,
                SENTINEL_EDGE_ID,
                Attributes::new(),
                self.at,
            );
        }
        if let Some(spdx_id) = repo.get("license").and_then(|l| str_at(l, "spdx_id")) {
            self.batch
                .update_node(NodeType::License, spdx_id, Attributes::new(), self.at);
            self.batch.update_edge(
                EdgeType::HasLicense,
                self.repo_id,
                spdx_id,
                SENTINEL_EDGE_ID,
                Attributes::new(),
                self.at,
            );
        }
        let mut fields = Attributes::new();
        for field in ["description", "default_branch", "updated_at", "created_at", "pushed_at"] {
            if let Some(value) = repo.get(field).filter(|v| !v.is_null() && *v != "") {
                fields.insert(field.into(), value.clone());
            }
        }
        if !fields.is_empty() {
            self.batch
                .update_node(NodeType::GithubRepo, self.repo_id, fields, self.at);
        }
    }
}

/// Applies one archive line to `batch`.
pub fn apply_line(batch: &mut GraphBatch, line: &str) -> Result<(), LineError> {
    let value: JsonValue = serde_json::from_str(line)?;
    let raw = RawEvent::deserialize(&value)?;
    let actor = raw.actor.as_ref().ok_or(LineError::MissingField("actor"))?;
    let repo = raw.repo.as_ref().ok_or(LineError::MissingField("repo"))?;
    let repo_name = repo.display_name().ok_or(LineError::MissingField("repo.name"))?;
    let at = raw.created_at;

    batch.update_node(NodeType::GithubRepo, repo.id, attrs(json!({ "name": repo_name })), at);
    batch.update_node(
        NodeType::GithubActor,
        actor.id,
        attrs(json!({ "login": actor.login })),
        at,
    );
    if let Some(org) = &raw.org {
        batch.update_node(NodeType::GithubOrg, org.id, attrs(json!({ "login": org.login })), at);
        batch.update_edge(
            EdgeType::HasRepo,
            org.id,
            repo.id,
            SENTINEL_EDGE_ID,
            Attributes::new(),
            at,
        );
    }

    let null = JsonValue::Null;
    let payload = raw.payload.as_ref().unwrap_or(&null);
    let mut ctx = LineContext {
        batch,
        event_id: raw.id as i64,
        actor_id: actor.id,
        repo_id: repo.id,
        action: raw.action().map(ToString::to_string),
        at,
    };

    match raw.kind.as_deref() {
        Some("IssuesEvent") => {
            ctx.issue(payload)?;
        }
        Some("IssueCommentEvent") => {
            let (key, _) = ctx.issue(payload)?;
            let body = payload.get("comment").and_then(|c| str_at(c, "body")).unwrap_or_default();
            ctx.action_edge(&key, attrs(json!({"type": "comment", "body": body})));
        }
        Some("PullRequestEvent") => {
            ctx.pull(payload)?;
        }
        Some("PullRequestReviewEvent") => {
            let key = ctx.pull(payload)?;
            let review = payload.get("review").cloned().unwrap_or(JsonValue::Null);
            ctx.action_edge(
                &key,
                attrs(json!({
                    "type": "review",
                    "body": str_at(&review, "body").unwrap_or_default(),
                    "state": str_at(&review, "state").unwrap_or_default(),
                })),
            );
        }
        Some("PullRequestReviewCommentEvent") => {
            let key = ctx.pull(payload)?;
            let comment = payload.get("comment").cloned().unwrap_or(JsonValue::Null);
            ctx.action_edge(
                &key,
                attrs(json!({
                    "type": "review_comment",
                    "body": str_at(&comment, "body").unwrap_or_default(),
                    "path": str_at(&comment, "path").unwrap_or_default(),
                    "position": u64_at(&comment, "position").unwrap_or(0),
                    "line": u64_at(&comment, "line").unwrap_or(0),
                    "start_line": u64_at(&comment, "start_line").unwrap_or(0),
                })),
            );
        }
        Some("WatchEvent") => {
            let timestamp = ctx.timestamp();
            ctx.batch.update_edge(
                EdgeType::Star,
                ctx.actor_id,
                ctx.repo_id,
                SENTINEL_EDGE_ID,
                attrs(json!({ "timestamp": timestamp })),
                at,
            );
        }
        Some("ForkEvent") => {
            let timestamp = ctx.timestamp();
            ctx.batch.update_edge(
                EdgeType::Fork,
                ctx.actor_id,
                ctx.repo_id,
                ctx.event_id,
                attrs(json!({ "timestamp": timestamp })),
                at,
            );
            let forkee = payload.get("forkee").unwrap_or(&null);
            if let (Some(id), Some(name)) = (u64_at(forkee, "id"), str_at(forkee, "full_name")) {
                ctx.batch
                    .update_node(NodeType::GithubRepo, id, attrs(json!({ "name": name })), at);
                ctx.batch.update_edge(
                    EdgeType::HasFork,
                    ctx.repo_id,
                    id,
                    SENTINEL_EDGE_ID,
                    Attributes::new(),
                    at,
                );
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use forgelog_core::NodeKey;
    use std::io::Write;

    fn line(id: u64, kind: &str, at: &str, payload: JsonValue) -> String {
        json!({
            "id": id.to_string(),
            "type": kind,
            "actor": {"id": 10, "login": "alice"},
            "repo": {"id": 20, "name": "octo/app"},
            "org": {"id": 30, "login": "octo"},
            "created_at": at,
            "payload": payload,
        })
        .to_string()
    }

    #[test]
    fn pull_request_close_records_merge_stats_and_base_repo() {
        let mut batch = GraphBatch::new();
        let payload = json!({
            "action": "closed",
            "number": 5,
            "pull_request": {
                "number": 5, "title": "feat", "merged": true,
                "commits": 2, "additions": 10, "deletions": 1, "changed_files": 3,
                "labels": [{"name": "enhancement"}],
                "requested_reviewers": [{"id": 11, "login": "bob"}],
                "base": {"ref": "main", "sha": "abc", "repo": {
                    "language": "Rust", "license": {"spdx_id": "MIT"},
                    "description": "app", "default_branch": "main"
                }},
                "head": {"ref": "feat", "sha": "def", "repo": {"id": 21, "full_name": "alice/app"}}
            }
        });
        apply_line(&mut batch, &line(1, "PullRequestEvent", "2024-05-01T10:00:00Z", payload)).unwrap();

        let key = NodeKey::from("20_5");
        let pr = batch.node(NodeType::GithubIssueChangeRequest, &key).unwrap();
        assert_eq!(pr["type"], json!("change_request"));
        assert_eq!(pr["commits"], json!(2));
        assert_eq!(pr["base_ref"], json!("main"));
        assert_eq!(pr["head_name"], json!("alice/app"));

        let close = batch.edge(EdgeType::Action, &NodeKey::Id(10), &key, 1).unwrap();
        assert_eq!(close["type"], json!("close"));
        assert_eq!(close["merged"], json!(true));
        assert_eq!(close["timestamp"], json!(1_714_557_600_000i64));

        assert_eq!(batch.edges_of(EdgeType::HasLanguage), 1);
        assert_eq!(batch.edges_of(EdgeType::HasLicense), 1);
        assert_eq!(batch.edges_of(EdgeType::HasRequestedReviewer), 1);
        assert_eq!(batch.edges_of(EdgeType::HasIssueLabel), 1);
        assert_eq!(batch.edges_of(EdgeType::HasRepo), 1);
        let repo = batch.node(NodeType::GithubRepo, &NodeKey::Id(20)).unwrap();
        assert_eq!(repo["description"], json!("app"));
    }

    #[test]
    fn issue_comment_on_a_pull_marks_change_request() {
        let mut batch = GraphBatch::new();
        let payload = json!({
            "action": "created",
            "issue": {"number": 8, "title": "t", "pull_request": {"url": "x"}, "assignees": [{"id": 12, "login": "carol"}]},
            "comment": {"body": "lgtm"}
        });
        apply_line(&mut batch, &line(2, "IssueCommentEvent", "2024-05-01T10:00:00Z", payload)).unwrap();

        let key = NodeKey::from("20_8");
        assert_eq!(
            batch.node(NodeType::GithubIssueChangeRequest, &key).unwrap()["type"],
            json!("change_request")
        );
        let comment = batch.edge(EdgeType::Action, &NodeKey::Id(10), &key, 2).unwrap();
        assert_eq!(comment["body"], json!("lgtm"));
        assert_eq!(batch.edges_of(EdgeType::HasAssignee), 1);
    }

    #[test]
    fn fork_adds_forkee_repo_and_keyed_edge() {
        let mut batch = GraphBatch::new();
        let payload = json!({"forkee": {"id": 99, "full_name": "alice/app"}});
        apply_line(&mut batch, &line(3, "ForkEvent", "2024-05-01T10:00:00Z", payload)).unwrap();
        assert_eq!(
            batch.node(NodeType::GithubRepo, &NodeKey::Id(99)).unwrap()["name"],
            json!("alice/app")
        );
        assert!(batch.edge(EdgeType::Fork, &NodeKey::Id(10), &NodeKey::Id(20), 3).is_some());
        assert!(batch
            .edge(EdgeType::HasFork, &NodeKey::Id(20), &NodeKey::Id(99), SENTINEL_EDGE_ID)
            .is_some());
    }

    #[test]
    fn bad_lines_are_counted_not_fatal() {
        let text = format!(
            "{}\nnot json\n{{\"id\": 4, \"type\": \"WatchEvent\", \"created_at\": \"2024-05-01T10:00:00Z\"}}\n\n{}\n",
            line(1, "WatchEvent", "2024-05-01T10:00:00Z", json!({"action": "started"})),
            line(2, "PullRequestEvent", "2024-05-01T10:00:00Z", json!({"action": "opened"})),
        );
        let (batch, stats) = parse_reader(text.as_bytes()).unwrap();
        assert_eq!(stats, ParseStats { lines: 4, skipped: 3 });
        assert_eq!(batch.edges_of(EdgeType::Star), 1);
    }

    #[test]
    fn invalid_utf8_line_is_skipped_and_neighbours_kept() {
        let mut bytes = line(1, "WatchEvent", "2024-05-01T10:00:00Z", json!({})).into_bytes();
        bytes.extend_from_slice(b"\n\xff\xfe garbage\n");
        bytes.extend_from_slice(
            line(2, "ForkEvent", "2024-05-01T10:00:00Z", json!({"forkee": {"id": 99}})).as_bytes(),
        );

        let (batch, stats) = parse_reader(bytes.as_slice()).unwrap();
        assert_eq!(stats, ParseStats { lines: 3, skipped: 1 });
        assert_eq!(batch.edges_of(EdgeType::Star), 1);
        assert_eq!(batch.edges_of(EdgeType::Fork), 1);
    }

    #[test]
    fn gzip_files_are_detected_by_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-05-01-10.json.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writeln!(encoder, "{}", line(1, "WatchEvent", "2024-05-01T10:00:00Z", json!({}))).unwrap();
        encoder.finish().unwrap();

        let (batch, stats) = parse_file(&path).unwrap();
        assert_eq!(stats.lines, 1);
        assert_eq!(batch.edges_of(EdgeType::Star), 1);
    }
}
