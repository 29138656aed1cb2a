//! Canonical, platform-independent event record and its flattening into store columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::event::Platform;

/// Canonical event category. Every canonical record carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalEventType {
    IssuesEvent,
    IssueCommentEvent,
    PullRequestEvent,
    PullRequestReviewEvent,
    PullRequestReviewCommentEvent,
    CommitCommentEvent,
    PushEvent,
    ForkEvent,
    WatchEvent,
}

impl CanonicalEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssuesEvent => "IssuesEvent",
            Self::IssueCommentEvent => "IssueCommentEvent",
            Self::PullRequestEvent => "PullRequestEvent",
            Self::PullRequestReviewEvent => "PullRequestReviewEvent",
            Self::PullRequestReviewCommentEvent => "PullRequestReviewCommentEvent",
            Self::CommitCommentEvent => "CommitCommentEvent",
            Self::PushEvent => "PushEvent",
            Self::ForkEvent => "ForkEvent",
            Self::WatchEvent => "WatchEvent",
        }
    }

    /// Comment categories always record the `created` action.
    pub fn is_comment(&self) -> bool {
        matches!(
            self,
            Self::IssueCommentEvent | Self::PullRequestReviewCommentEvent
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLabel {
    pub name: String,
    pub color: String,
    pub default: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueFields {
    pub id: u64,
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
    pub labels: Vec<IssueLabel>,
    pub author: Option<UserRef>,
    pub author_association: Option<String>,
    pub assignee: Option<UserRef>,
    pub assignees: Vec<UserRef>,
    pub comments: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentFields {
    pub id: u64,
    pub body: Option<String>,
    pub author: Option<UserRef>,
    pub author_association: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullFields {
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by: Option<UserRef>,
    pub merge_commit_sha: Option<String>,
    pub commits: Option<u64>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub changed_files: Option<u64>,
    pub review_comments: Option<u64>,
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
    pub head_repo: Option<(u64, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFields {
    pub id: u64,
    pub state: Option<String>,
    pub body: Option<String>,
    pub author_association: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitCommentFields {
    pub id: u64,
    pub body: Option<String>,
    pub commit_sha: Option<String>,
    pub path: Option<String>,
    pub position: Option<String>,
    pub line: Option<String>,
    pub author: Option<UserRef>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushCommit {
    pub name: String,
    pub email: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFields {
    pub push_id: Option<u64>,
    pub size: Option<u64>,
    pub distinct_size: Option<u64>,
    pub git_ref: Option<String>,
    pub head: Option<String>,
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkFields {
    pub forkee_id: Option<u64>,
    pub full_name: Option<String>,
    pub owner: Option<UserRef>,
}

/// Category-specific part of a canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Issue(IssueFields),
    IssueComment {
        issue: IssueFields,
        comment: CommentFields,
    },
    PullRequest {
        issue: IssueFields,
        pull: PullFields,
    },
    PullRequestReview {
        issue: IssueFields,
        pull: PullFields,
        review: ReviewFields,
    },
    PullRequestReviewComment {
        issue: IssueFields,
        comment: CommentFields,
    },
    CommitComment(CommitCommentFields),
    Push(PushFields),
    Fork(ForkFields),
    Star,
}

impl EventPayload {
    pub fn event_type(&self) -> CanonicalEventType {
        match self {
            EventPayload::Issue(_) => CanonicalEventType::IssuesEvent,
            EventPayload::IssueComment { .. } => CanonicalEventType::IssueCommentEvent,
            EventPayload::PullRequest { .. } => CanonicalEventType::PullRequestEvent,
            EventPayload::PullRequestReview { .. } => CanonicalEventType::PullRequestReviewEvent,
            EventPayload::PullRequestReviewComment { .. } => {
                CanonicalEventType::PullRequestReviewCommentEvent
            }
            EventPayload::CommitComment(_) => CanonicalEventType::CommitCommentEvent,
            EventPayload::Push(_) => CanonicalEventType::PushEvent,
            EventPayload::Fork(_) => CanonicalEventType::ForkEvent,
            EventPayload::Star => CanonicalEventType::WatchEvent,
        }
    }

    pub fn issue(&self) -> Option<&IssueFields> {
        match self {
            EventPayload::Issue(issue)
            | EventPayload::IssueComment { issue, .. }
            | EventPayload::PullRequest { issue, .. }
            | EventPayload::PullRequestReview { issue, .. }
            | EventPayload::PullRequestReviewComment { issue, .. } => Some(issue),
            _ => None,
        }
    }
}

/// Normalized event ready for the columnar store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub platform: Platform,
    pub id: u64,
    pub actor: UserRef,
    pub repo_id: u64,
    pub repo_name: String,
    pub org: Option<UserRef>,
    pub created_at: DateTime<Utc>,
    pub action: Option<String>,
    pub payload: EventPayload,
}

impl CanonicalEvent {
    pub fn event_type(&self) -> CanonicalEventType {
        self.payload.event_type()
    }

    /// Flattens the record into the store's column layout.
    ///
    /// Nested groups are emitted as parallel arrays (`issue_labels.name`, `issue_labels.color`, ...)
    /// of identical length. Columns a category does not fill are omitted so the store applies
    /// its defaults.
    pub fn to_row(&self) -> Map<String, JsonValue> {
        let mut row = Map::new();
        row.insert("platform".into(), json!(self.platform.as_str()));
        row.insert("id".into(), json!(self.id));
        row.insert("type".into(), json!(self.event_type().as_str()));
        row.insert("actor_id".into(), json!(self.actor.id));
        row.insert("actor_login".into(), json!(self.actor.login));
        row.insert("repo_id".into(), json!(self.repo_id));
        row.insert("repo_name".into(), json!(self.repo_name));
        row.insert("created_at".into(), json!(format_datetime(&self.created_at)));
        if let Some(action) = &self.action {
            row.insert("action".into(), json!(action));
        }
        if let Some(org) = &self.org {
            row.insert("org_id".into(), json!(org.id));
            row.insert("org_login".into(), json!(org.login));
        }

        match &self.payload {
            EventPayload::Issue(issue) => write_issue(&mut row, issue),
            EventPayload::IssueComment { issue, comment }
            | EventPayload::PullRequestReviewComment { issue, comment } => {
                write_issue(&mut row, issue);
                write_comment(&mut row, comment);
            }
            EventPayload::PullRequest { issue, pull } => {
                write_issue(&mut row, issue);
                write_pull(&mut row, pull);
            }
            EventPayload::PullRequestReview {
                issue,
                pull,
                review,
            } => {
                write_issue(&mut row, issue);
                write_pull(&mut row, pull);
                row.insert("pull_review_id".into(), json!(review.id));
                put_opt(&mut row, "pull_review_state", review.state.as_ref());
                put_opt(
                    &mut row,
                    "pull_review_author_association",
                    review.author_association.as_ref(),
                );
                put_opt(&mut row, "body", review.body.as_ref());
            }
            EventPayload::CommitComment(comment) => {
                row.insert("commit_comment_id".into(), json!(comment.id));
                put_opt(&mut row, "body", comment.body.as_ref());
                put_opt(&mut row, "commit_comment_sha", comment.commit_sha.as_ref());
                put_opt(&mut row, "commit_comment_path", comment.path.as_ref());
                put_opt(&mut row, "commit_comment_position", comment.position.as_ref());
                put_opt(&mut row, "commit_comment_line", comment.line.as_ref());
                if let Some(author) = &comment.author {
                    row.insert("commit_comment_author_id".into(), json!(author.id));
                    row.insert("commit_comment_author_login".into(), json!(author.login));
                }
                put_time(&mut row, "commit_comment_created_at", comment.created_at);
                put_time(&mut row, "commit_comment_updated_at", comment.updated_at);
            }
            EventPayload::Push(push) => {
                put_opt(&mut row, "push_id", push.push_id.as_ref());
                put_opt(&mut row, "push_size", push.size.as_ref());
                put_opt(&mut row, "push_distinct_size", push.distinct_size.as_ref());
                put_opt(&mut row, "push_ref", push.git_ref.as_ref());
                put_opt(&mut row, "push_head", push.head.as_ref());
                row.insert(
                    "push_commits.name".into(),
                    json!(push.commits.iter().map(|c| &c.name).collect::<Vec<_>>()),
                );
                row.insert(
                    "push_commits.email".into(),
                    json!(push.commits.iter().map(|c| &c.email).collect::<Vec<_>>()),
                );
                row.insert(
                    "push_commits.message".into(),
                    json!(push.commits.iter().map(|c| &c.message).collect::<Vec<_>>()),
                );
            }
            EventPayload::Fork(fork) => {
                put_opt(&mut row, "fork_forkee_id", fork.forkee_id.as_ref());
                put_opt(&mut row, "fork_forkee_full_name", fork.full_name.as_ref());
                if let Some(owner) = &fork.owner {
                    row.insert("fork_forkee_owner_id".into(), json!(owner.id));
                    row.insert("fork_forkee_owner_login".into(), json!(owner.login));
                }
            }
            EventPayload::Star => {}
        }
        row
    }
}

fn write_issue(row: &mut Map<String, JsonValue>, issue: &IssueFields) {
    row.insert("issue_id".into(), json!(issue.id));
    row.insert("issue_number".into(), json!(issue.number));
    put_opt(row, "issue_title", issue.title.as_ref());
    put_opt(row, "body", issue.body.as_ref());
    row.insert(
        "issue_labels.name".into(),
        json!(issue.labels.iter().map(|l| &l.name).collect::<Vec<_>>()),
    );
    row.insert(
        "issue_labels.color".into(),
        json!(issue.labels.iter().map(|l| &l.color).collect::<Vec<_>>()),
    );
    row.insert(
        "issue_labels.default".into(),
        json!(issue.labels.iter().map(|l| u8::from(l.default)).collect::<Vec<_>>()),
    );
    row.insert(
        "issue_labels.description".into(),
        json!(issue.labels.iter().map(|l| &l.description).collect::<Vec<_>>()),
    );
    if let Some(author) = &issue.author {
        row.insert("issue_author_id".into(), json!(author.id));
        row.insert("issue_author_login".into(), json!(author.login));
    }
    put_opt(
        row,
        "issue_author_association",
        issue.author_association.as_ref(),
    );
    if let Some(assignee) = &issue.assignee {
        row.insert("issue_assignee_id".into(), json!(assignee.id));
        row.insert("issue_assignee_login".into(), json!(assignee.login));
    }
    row.insert(
        "issue_assignees.login".into(),
        json!(issue.assignees.iter().map(|a| &a.login).collect::<Vec<_>>()),
    );
    row.insert(
        "issue_assignees.id".into(),
        json!(issue.assignees.iter().map(|a| a.id).collect::<Vec<_>>()),
    );
    put_opt(row, "issue_comments", issue.comments.as_ref());
    put_time(row, "issue_created_at", issue.created_at);
    put_time(row, "issue_updated_at", issue.updated_at);
    put_time(row, "issue_closed_at", issue.closed_at);
}

fn write_comment(row: &mut Map<String, JsonValue>, comment: &CommentFields) {
    row.insert("issue_comment_id".into(), json!(comment.id));
    put_opt(row, "body", comment.body.as_ref());
    if let Some(author) = &comment.author {
        row.insert("issue_comment_author_id".into(), json!(author.id));
        row.insert("issue_comment_author_login".into(), json!(author.login));
    }
    put_opt(
        row,
        "issue_comment_author_association",
        comment.author_association.as_ref(),
    );
    put_time(row, "issue_comment_created_at", comment.created_at);
    put_time(row, "issue_comment_updated_at", comment.updated_at);
}

fn write_pull(row: &mut Map<String, JsonValue>, pull: &PullFields) {
    row.insert("pull_merged".into(), json!(u8::from(pull.merged)));
    put_time(row, "pull_merged_at", pull.merged_at);
    if let Some(by) = &pull.merged_by {
        row.insert("pull_merged_by_id".into(), json!(by.id));
        row.insert("pull_merged_by_login".into(), json!(by.login));
    }
    put_opt(row, "pull_merge_commit_sha", pull.merge_commit_sha.as_ref());
    put_opt(row, "pull_commits", pull.commits.as_ref());
    put_opt(row, "pull_additions", pull.additions.as_ref());
    put_opt(row, "pull_deletions", pull.deletions.as_ref());
    put_opt(row, "pull_changed_files", pull.changed_files.as_ref());
    put_opt(row, "pull_review_comments", pull.review_comments.as_ref());
    put_opt(row, "pull_base_ref", pull.base_ref.as_ref());
    put_opt(row, "pull_head_ref", pull.head_ref.as_ref());
    if let Some((id, name)) = &pull.head_repo {
        row.insert("pull_head_repo_id".into(), json!(id));
        row.insert("pull_head_repo_name".into(), json!(name));
    }
}

fn put_opt<T: Serialize>(row: &mut Map<String, JsonValue>, column: &str, value: Option<&T>) {
    if let Some(value) = value {
        row.insert(column.to_string(), json!(value));
    }
}

fn put_time(row: &mut Map<String, JsonValue>, column: &str, value: Option<DateTime<Utc>>) {
    if let Some(value) = value {
        row.insert(column.to_string(), json!(format_datetime(&value)));
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, the store's `DateTime` text form.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Escapes single quotes for values that end up inside generated query text.
pub fn escape_nested(value: &str) -> String {
    value.replace('\'', "\\'")
}
