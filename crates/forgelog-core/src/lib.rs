//! Core domain model for forgelog: raw vendor events, canonical records, sync cursors and the
//! property-graph vocabulary.

pub mod canonical;
pub mod cursor;
pub mod event;
pub mod graph;

pub use canonical::{
    escape_nested, format_datetime, CanonicalEvent, CanonicalEventType, CommentFields,
    CommitCommentFields, EventPayload, ForkFields, IssueFields, IssueLabel, PullFields,
    PushCommit, PushFields, ReviewFields, UserRef,
};
pub use cursor::{EntityKind, PageEntry, PageStep, SyncCursor, SyncStage, TrackedEntity, Watermark};
pub use event::{flexible_u64, Platform, RawActor, RawEvent, RawRepo};
pub use graph::{
    Attributes, EdgeRecord, EdgeType, NodeKey, NodeRecord, NodeType, SENTINEL_EDGE_ID,
};
