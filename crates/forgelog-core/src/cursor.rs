//! Per-entity incremental sync position and the page-driven stage machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Org,
    Repo,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Org => "org",
            EntityKind::Repo => "repo",
        }
    }
}

/// Organization or repository whose event feed is synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub name: String,
    pub kind: EntityKind,
    /// Creation time of the org/repo itself, when discovery knows it.
    pub created_at: Option<DateTime<Utc>>,
}

/// Newest/oldest persisted event ids for one entity, as derived from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark {
    pub max_id: u64,
    pub min_id: u64,
    pub min_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    New,
    Old,
    Break,
}

/// One raw page entry: the vendor id (always present) plus its normalized form, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct PageEntry<T> {
    pub id: u64,
    pub record: Option<T>,
}

/// What the caller must do after a page has been applied to a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStep<T> {
    pub to_insert: Vec<T>,
    pub fetch_next: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity: TrackedEntity,
    pub max_id: u64,
    pub min_id: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub min_created_at: Option<DateTime<Utc>>,
    /// Pagination token for the next fetch; `-1` starts from the newest event.
    pub prev_id: i64,
    pub stage: SyncStage,
}

impl SyncCursor {
    pub fn new(entity: TrackedEntity, watermark: Watermark) -> Self {
        Self {
            created_at: entity.created_at,
            entity,
            max_id: watermark.max_id,
            min_id: watermark.min_id,
            min_created_at: watermark.min_created_at,
            prev_id: -1,
            stage: SyncStage::New,
        }
    }

    /// True once the oldest stored event sits within `threshold` of the entity's creation.
    pub fn is_backfilled(&self, threshold: Duration) -> bool {
        match (self.created_at, self.min_created_at) {
            (Some(created), Some(oldest)) => oldest - created < threshold,
            _ => false,
        }
    }

    /// Applies one page (ids in descending order) and returns the records to persist.
    ///
    /// An empty page always ends the chain. In `New` the scan stops at the first id that is
    /// `<= max_id`; reaching it moves the cursor to `Old` (resume below `min_id`) or `Break`
    /// (history already complete, or nothing older is known).
    pub fn advance<T>(&mut self, page: Vec<PageEntry<T>>, threshold: Duration) -> PageStep<T> {
        if self.stage == SyncStage::Break {
            return PageStep {
                to_insert: Vec::new(),
                fetch_next: false,
            };
        }
        let Some(oldest) = page.last().map(|e| e.id) else {
            return PageStep {
                to_insert: Vec::new(),
                fetch_next: false,
            };
        };
        self.prev_id = oldest as i64;

        if self.stage == SyncStage::Old || self.max_id == 0 {
            return PageStep {
                to_insert: page.into_iter().filter_map(|e| e.record).collect(),
                fetch_next: true,
            };
        }

        let mut to_insert = Vec::new();
        let mut hit_boundary = false;
        for entry in page {
            if entry.id <= self.max_id {
                hit_boundary = true;
                break;
            }
            if let Some(record) = entry.record {
                to_insert.push(record);
            }
        }

        if !hit_boundary {
            return PageStep {
                to_insert,
                fetch_next: true,
            };
        }

        if self.min_id > 0 && !self.is_backfilled(threshold) {
            self.stage = SyncStage::Old;
            self.prev_id = self.min_id as i64;
        } else {
            self.stage = SyncStage::Break;
        }
        PageStep {
            to_insert,
            fetch_next: self.stage == SyncStage::Old,
        }
    }
}
