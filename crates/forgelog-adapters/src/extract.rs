//! JSON field readers and the per-category extractors shared by both platforms.

use chrono::{DateTime, Utc};
use forgelog_core::{
    escape_nested, flexible_u64, CommentFields, CommitCommentFields, ForkFields, IssueFields,
    IssueLabel, PullFields, PushCommit, PushFields, ReviewFields, UserRef,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid {field} `{value}`")]
    InvalidNumber { field: &'static str, value: String },
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub(crate) fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
}

pub(crate) fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    json_at(value, path).and_then(flexible_u64)
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> bool {
    json_at(value, path)
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

pub(crate) fn json_time(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    let text = json_at(value, path)?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Scalar rendered as text; vendors disagree on whether positions are numbers or strings.
pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub(crate) fn user_at(value: &JsonValue, path: &[&str]) -> Option<UserRef> {
    let user = json_at(value, path)?;
    Some(UserRef {
        id: json_u64(user, &["id"])?,
        login: json_str(user, &["login"])?,
    })
}

/// Parses an issue or pull-request number in the platform's radix.
pub(crate) fn parse_number(value: &JsonValue, radix: u32) -> Result<u64, ExtractError> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return Err(ExtractError::MissingField("number")),
    };
    u64::from_str_radix(&text, radix).map_err(|_| ExtractError::InvalidNumber {
        field: "number",
        value: text,
    })
}

fn require_id(value: &JsonValue, field: &'static str) -> Result<u64, ExtractError> {
    json_u64(value, &["id"])
        .filter(|id| *id > 0)
        .ok_or(ExtractError::MissingField(field))
}

/// Issue-shaped object (issue or pull request). Requires `id` and `number`.
pub(crate) fn issue(value: Option<&JsonValue>, number_radix: u32) -> Result<IssueFields, ExtractError> {
    let value = value.ok_or(ExtractError::MissingField("issue"))?;
    let id = require_id(value, "issue.id")?;
    let number = json_at(value, &["number"]).ok_or(ExtractError::MissingField("issue.number"))?;
    let number = parse_number(number, number_radix)?;
    if number == 0 {
        return Err(ExtractError::MissingField("issue.number"));
    }

    let labels = json_array(value, &["labels"])
        .iter()
        .map(|l| IssueLabel {
            name: escape_nested(&json_str(l, &["name"]).unwrap_or_default()),
            color: escape_nested(&json_str(l, &["color"]).unwrap_or_default()),
            default: json_bool(l, &["default"]),
            description: escape_nested(&json_str(l, &["description"]).unwrap_or_default()),
        })
        .collect();
    let assignees = json_array(value, &["assignees"])
        .iter()
        .filter_map(|a| user_at(a, &[]))
        .collect();

    Ok(IssueFields {
        id,
        number,
        title: json_str(value, &["title"]),
        body: json_str(value, &["body"]),
        labels,
        author: user_at(value, &["user"]),
        author_association: json_str(value, &["author_association"]),
        assignee: user_at(value, &["assignee"]),
        assignees,
        comments: json_u64(value, &["comments"]),
        created_at: json_time(value, &["created_at"]),
        updated_at: json_time(value, &["updated_at"]),
        closed_at: json_time(value, &["closed_at"]).or_else(|| json_time(value, &["finished_at"])),
    })
}

/// Issue or review comment. Requires `id`.
pub(crate) fn comment(value: Option<&JsonValue>) -> Result<CommentFields, ExtractError> {
    let value = value.ok_or(ExtractError::MissingField("comment"))?;
    Ok(CommentFields {
        id: require_id(value, "comment.id")?,
        body: json_str(value, &["body"]),
        author: user_at(value, &["user"]),
        author_association: json_str(value, &["author_association"]),
        created_at: json_time(value, &["created_at"]),
        updated_at: json_time(value, &["updated_at"]),
    })
}

pub(crate) fn commit_comment(value: Option<&JsonValue>) -> Result<CommitCommentFields, ExtractError> {
    let value = value.ok_or(ExtractError::MissingField("comment"))?;
    Ok(CommitCommentFields {
        id: require_id(value, "comment.id")?,
        body: json_str(value, &["body"]),
        commit_sha: json_str(value, &["commit_id"]),
        path: json_str(value, &["path"]),
        position: json_text(value, &["position"]),
        line: json_text(value, &["line"]),
        author: user_at(value, &["user"]),
        created_at: json_time(value, &["created_at"]),
        updated_at: json_time(value, &["updated_at"]),
    })
}

/// Pull-request specific columns; `merged` is taken from the payload flag or a `merged` action.
pub(crate) fn pull(value: &JsonValue, merged_action: bool) -> PullFields {
    let head_repo = json_u64(value, &["head", "repo", "id"]).zip(
        json_str(value, &["head", "repo", "full_name"])
            .or_else(|| json_str(value, &["head", "repo", "name"])),
    );
    PullFields {
        merged: merged_action || json_bool(value, &["merged"]),
        merged_at: json_time(value, &["merged_at"]),
        merged_by: user_at(value, &["merged_by"]),
        merge_commit_sha: json_str(value, &["merge_commit_sha"]),
        commits: json_u64(value, &["commits"]),
        additions: json_u64(value, &["additions"]),
        deletions: json_u64(value, &["deletions"]),
        changed_files: json_u64(value, &["changed_files"]),
        review_comments: json_u64(value, &["review_comments"]),
        base_ref: json_str(value, &["base", "ref"]),
        head_ref: json_str(value, &["head", "ref"]),
        head_repo,
    }
}

pub(crate) fn review(value: Option<&JsonValue>) -> Result<ReviewFields, ExtractError> {
    let value = value.ok_or(ExtractError::MissingField("review"))?;
    Ok(ReviewFields {
        id: require_id(value, "review.id")?,
        state: json_str(value, &["state"]),
        body: json_str(value, &["body"]),
        author_association: json_str(value, &["author_association"]),
    })
}

/// Push payload; `head_key` differs per platform (`head` vs `after`).
pub(crate) fn push(value: &JsonValue, head_key: &str) -> PushFields {
    let commits = json_array(value, &["commits"])
        .iter()
        .map(|c| PushCommit {
            name: escape_nested(&json_str(c, &["author", "name"]).unwrap_or_default()),
            email: escape_nested(&json_str(c, &["author", "email"]).unwrap_or_default()),
            message: escape_nested(&json_str(c, &["message"]).unwrap_or_default()),
        })
        .collect();
    PushFields {
        push_id: json_u64(value, &["push_id"]),
        size: json_u64(value, &["size"]),
        distinct_size: json_u64(value, &["distinct_size"]),
        git_ref: json_str(value, &["ref"]),
        head: json_str(value, &[head_key]),
        commits,
    }
}

pub(crate) fn fork(forkee: Option<&JsonValue>) -> ForkFields {
    match forkee {
        Some(f) => ForkFields {
            forkee_id: json_u64(f, &["id"]),
            full_name: json_str(f, &["full_name"]),
            owner: user_at(f, &["owner"]),
        },
        None => ForkFields {
            forkee_id: None,
            full_name: None,
            owner: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_parse_in_platform_radix() {
        assert_eq!(parse_number(&json!("I4ABCD"), 36).unwrap(), 1_095_590_893);
        assert_eq!(parse_number(&json!("10"), 36).unwrap(), 36);
        assert_eq!(parse_number(&json!(10), 10).unwrap(), 10);
        assert!(matches!(
            parse_number(&json!("I4AB"), 10),
            Err(ExtractError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn issue_requires_id_and_number_but_defaults_lists() {
        let err = issue(Some(&json!({"number": "1"})), 10).unwrap_err();
        assert_eq!(err, ExtractError::MissingField("issue.id"));
        let err = issue(Some(&json!({"id": 3})), 10).unwrap_err();
        assert_eq!(err, ExtractError::MissingField("issue.number"));

        let fields = issue(Some(&json!({"id": 3, "number": 4, "labels": null})), 10).unwrap();
        assert!(fields.labels.is_empty());
        assert!(fields.assignees.is_empty());
    }

    #[test]
    fn label_and_commit_strings_are_escaped() {
        let fields = issue(
            Some(&json!({"id": 1, "number": 2, "labels": [{"name": "won't fix"}]})),
            10,
        )
        .unwrap();
        assert_eq!(fields.labels[0].name, "won\\'t fix");

        let p = push(&json!({"commits": [{"message": "it's", "author": {"name": "o'neil"}}]}), "head");
        assert_eq!(p.commits[0].message, "it\\'s");
        assert_eq!(p.commits[0].name, "o\\'neil");
        assert_eq!(p.commits[0].email, "");
    }

    #[test]
    fn gitee_finished_at_fills_closed_at() {
        let fields = issue(
            Some(&json!({"id": 1, "number": "A", "finished_at": "2023-05-01T08:00:00+08:00"})),
            36,
        )
        .unwrap();
        assert_eq!(fields.number, 10);
        assert_eq!(
            fields.closed_at.map(|t| t.to_rfc3339()),
            Some("2023-05-01T00:00:00+00:00".to_string())
        );
    }
}
