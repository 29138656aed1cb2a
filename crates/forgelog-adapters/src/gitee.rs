//! Gitee REST events (`/orgs/{org}/events`, `/networks/{owner}/{repo}/events`).

use forgelog_core::{CanonicalEventType, EventPayload, Platform};
use serde_json::Value as JsonValue;

use crate::extract::{self, json_at, ExtractError};
use crate::{ActionMapping, EventNormalizer};

#[derive(Debug, Clone, Copy, Default)]
pub struct GiteeNormalizer;

const UNSUPPORTED: [&str; 5] = [
    "CreateEvent",
    "DeleteEvent",
    "MemberEvent",
    "ProjectCommentEvent",
    "MilestoneEvent",
];

impl EventNormalizer for GiteeNormalizer {
    fn platform(&self) -> Platform {
        Platform::Gitee
    }

    fn is_unsupported(&self, kind: Option<&str>) -> bool {
        match kind {
            None => true,
            Some(kind) => UNSUPPORTED.contains(&kind),
        }
    }

    fn supported_type(&self, kind: &str) -> Option<CanonicalEventType> {
        use CanonicalEventType::*;
        Some(match kind {
            "IssueEvent" => IssuesEvent,
            "IssueCommentEvent" => IssueCommentEvent,
            "PullRequestEvent" => PullRequestEvent,
            "PullRequestCommentEvent" => PullRequestReviewCommentEvent,
            "CommitCommentEvent" => CommitCommentEvent,
            "PushEvent" => PushEvent,
            "StarEvent" => WatchEvent,
            "ForkEvent" => ForkEvent,
            _ => return None,
        })
    }

    fn map_action(&self, action: &str) -> ActionMapping {
        match action {
            "opened" | "open" => ActionMapping::Mapped("opened"),
            "closed" | "rejected" | "merged" => ActionMapping::Mapped("closed"),
            "starred" => ActionMapping::Mapped("started"),
            "progressing" => ActionMapping::NoOp,
            _ => ActionMapping::Unknown,
        }
    }

    fn extract(
        &self,
        kind: CanonicalEventType,
        payload: &JsonValue,
    ) -> Result<EventPayload, ExtractError> {
        let issue_radix = Platform::Gitee.issue_number_radix();
        Ok(match kind {
            CanonicalEventType::IssuesEvent => {
                EventPayload::Issue(extract::issue(Some(payload), issue_radix)?)
            }
            CanonicalEventType::IssueCommentEvent => EventPayload::IssueComment {
                issue: extract::issue(json_at(payload, &["issue"]), issue_radix)?,
                comment: extract::comment(json_at(payload, &["comment"]))?,
            },
            // The pull request object is the payload itself and its number is decimal.
            CanonicalEventType::PullRequestEvent => {
                let merged = payload.get("action").and_then(JsonValue::as_str) == Some("merged");
                EventPayload::PullRequest {
                    issue: extract::issue(Some(payload), Platform::Gitee.pull_number_radix())?,
                    pull: extract::pull(payload, merged),
                }
            }
            CanonicalEventType::PullRequestReviewCommentEvent => {
                EventPayload::PullRequestReviewComment {
                    issue: extract::issue(json_at(payload, &["pull_request"]), issue_radix)?,
                    comment: extract::comment(json_at(payload, &["comment"]))?,
                }
            }
            CanonicalEventType::CommitCommentEvent => {
                EventPayload::CommitComment(extract::commit_comment(json_at(payload, &["comment"]))?)
            }
            CanonicalEventType::PushEvent => EventPayload::Push(extract::push(payload, "after")),
            CanonicalEventType::ForkEvent => {
                EventPayload::Fork(extract::fork(json_at(payload, &["forkee"]).or(Some(payload))))
            }
            CanonicalEventType::WatchEvent => EventPayload::Star,
            CanonicalEventType::PullRequestReviewEvent => {
                return Err(ExtractError::MissingField("pull_request_review"))
            }
        })
    }
}
