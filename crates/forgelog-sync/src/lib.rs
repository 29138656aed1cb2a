//! Sync jobs: Gitee incremental event sync, GitHub archive import into the graph, and scheduling.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod materializer;
pub mod orchestrator;
pub mod single_flight;
pub mod watermark;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, TrackedEntitiesFile, TrackedOrg};
pub use controller::{EventFeed, GiteeFeed, IncrementalSyncController, SyncReport};
pub use discovery::EntityDiscovery;
pub use materializer::{CommitReport, CommitTicket, GraphBatch, GraphMaterializer, LineError};
pub use orchestrator::{
    archive_hour, imported_marker, pending_archives, ImportReport, JobOutcome, Orchestrator,
    GITEE_JOB_KEY, LOG_IMPORT_JOB_KEY,
};
pub use single_flight::{FlightGuard, SingleFlight};
pub use watermark::{WatermarkMap, WatermarkStore};

pub const CRATE_NAME: &str = "forgelog-sync";
