//! GitHub events as published in the hourly event archive.

use forgelog_core::{CanonicalEventType, EventPayload, Platform};
use serde_json::Value as JsonValue;

use crate::extract::{self, json_at, ExtractError};
use crate::{ActionMapping, EventNormalizer};

#[derive(Debug, Clone, Copy, Default)]
pub struct GitHubNormalizer;

const UNSUPPORTED: [&str; 7] = [
    "CreateEvent",
    "DeleteEvent",
    "MemberEvent",
    "PublicEvent",
    "GollumEvent",
    "ReleaseEvent",
    "SponsorshipEvent",
];

impl EventNormalizer for GitHubNormalizer {
    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    fn is_unsupported(&self, kind: Option<&str>) -> bool {
        kind.map_or(true, |k| UNSUPPORTED.contains(&k))
    }

    fn supported_type(&self, kind: &str) -> Option<CanonicalEventType> {
        use CanonicalEventType::*;
        [
            IssuesEvent,
            IssueCommentEvent,
            PullRequestEvent,
            PullRequestReviewEvent,
            PullRequestReviewCommentEvent,
            CommitCommentEvent,
            PushEvent,
            WatchEvent,
            ForkEvent,
        ]
        .into_iter()
        .find(|t| t.as_str() == kind)
    }

    fn map_action(&self, action: &str) -> ActionMapping {
        match action {
            "opened" => ActionMapping::Mapped("opened"),
            "reopened" => ActionMapping::Mapped("reopened"),
            "closed" => ActionMapping::Mapped("closed"),
            "created" => ActionMapping::Mapped("created"),
            "started" => ActionMapping::Mapped("started"),
            "submitted" => ActionMapping::Mapped("submitted"),
            "edited" | "deleted" | "synchronize" | "labeled" | "unlabeled" | "assigned"
            | "unassigned" => ActionMapping::NoOp,
            _ => ActionMapping::Unknown,
        }
    }

    fn extract(
        &self,
        kind: CanonicalEventType,
        payload: &JsonValue,
    ) -> Result<EventPayload, ExtractError> {
        let radix = Platform::GitHub.issue_number_radix();
        let pull_request = json_at(payload, &["pull_request"]);
        Ok(match kind {
            CanonicalEventType::IssuesEvent => {
                EventPayload::Issue(extract::issue(json_at(payload, &["issue"]), radix)?)
            }
            CanonicalEventType::IssueCommentEvent => EventPayload::IssueComment {
                issue: extract::issue(json_at(payload, &["issue"]), radix)?,
                comment: extract::comment(json_at(payload, &["comment"]))?,
            },
            CanonicalEventType::PullRequestEvent => EventPayload::PullRequest {
                issue: extract::issue(pull_request, radix)?,
                pull: pull_fields(pull_request),
            },
            CanonicalEventType::PullRequestReviewEvent => EventPayload::PullRequestReview {
                issue: extract::issue(pull_request, radix)?,
                pull: pull_fields(pull_request),
                review: extract::review(json_at(payload, &["review"]))?,
            },
            CanonicalEventType::PullRequestReviewCommentEvent => {
                EventPayload::PullRequestReviewComment {
                    issue: extract::issue(pull_request, radix)?,
                    comment: extract::comment(json_at(payload, &["comment"]))?,
                }
            }
            CanonicalEventType::CommitCommentEvent => {
                EventPayload::CommitComment(extract::commit_comment(json_at(payload, &["comment"]))?)
            }
            CanonicalEventType::PushEvent => EventPayload::Push(extract::push(payload, "head")),
            CanonicalEventType::ForkEvent => {
                EventPayload::Fork(extract::fork(json_at(payload, &["forkee"])))
            }
            CanonicalEventType::WatchEvent => EventPayload::Star,
        })
    }
}

fn pull_fields(pull_request: Option<&JsonValue>) -> forgelog_core::PullFields {
    pull_request
        .map(|p| extract::pull(p, false))
        .unwrap_or_default()
}
