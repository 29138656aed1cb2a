//! Composes discovery, incremental sync, downloads and graph materialization into jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use forgelog_adapters::normalizer_for;
use forgelog_core::Platform;
use forgelog_storage::{
    ArchiveDownloader, ClickHouseGateway, ColumnarGateway, DownloadReport, GraphGateway,
    HttpFetcher, Neo4jGraphStore, RequestExecutor, Transport,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::OnceCell;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{AppConfig, TrackedEntitiesFile};
use crate::controller::{GiteeFeed, IncrementalSyncController, SyncReport};
use crate::discovery::EntityDiscovery;
use crate::materializer::{CommitReport, GraphMaterializer};
use crate::single_flight::SingleFlight;

pub const GITEE_JOB_KEY: &str = "GiteeImporterTask";
pub const LOG_IMPORT_JOB_KEY: &str = "GitHubImporterTask";
pub const IMPORTED_MARKER_SUFFIX: &str = ".imported";

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Completed(T),
    /// Another run with the same job key was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub files: usize,
    pub committed: usize,
    pub failed: usize,
    pub lines: usize,
    pub skipped_lines: usize,
    pub nodes: usize,
    pub edges: usize,
    /// Committed files whose `.imported` marker could not be written.
    pub unmarked: usize,
    pub reports: Vec<CommitReport>,
}

pub struct Orchestrator {
    config: AppConfig,
    flights: SingleFlight,
    transport: Arc<dyn Transport>,
    columnar: Arc<dyn ColumnarGateway>,
    graph: OnceCell<Arc<dyn GraphGateway>>,
    downloader: Option<ArchiveDownloader>,
}

impl Orchestrator {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client()).context("building http client")?;
        let clickhouse_client = config
            .clickhouse_http()
            .build_client()
            .context("building clickhouse client")?;
        let columnar = ClickHouseGateway::new(clickhouse_client, config.clickhouse());
        let downloader = ArchiveDownloader::from_config(
            &config.http_client(),
            config.data_dir.clone(),
            config.downloader_workers,
            Duration::from_secs(config.downloader_timeout_secs),
        )
        .context("building archive download client")?;
        Ok(Self {
            config,
            flights: SingleFlight::new(),
            transport: Arc::new(fetcher),
            columnar: Arc::new(columnar),
            graph: OnceCell::new(),
            downloader: Some(downloader),
        })
    }

    /// Assembles an orchestrator from prebuilt collaborators; a missing graph is connected lazily.
    pub fn with_parts(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        columnar: Arc<dyn ColumnarGateway>,
        graph: Option<Arc<dyn GraphGateway>>,
        downloader: Option<ArchiveDownloader>,
    ) -> Self {
        Self {
            config,
            flights: SingleFlight::new(),
            transport,
            columnar,
            graph: OnceCell::new_with(graph),
            downloader,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    async fn graph(&self) -> Result<Arc<dyn GraphGateway>> {
        let graph = self
            .graph
            .get_or_try_init(|| async {
                let store = Neo4jGraphStore::connect(&self.config.neo4j()).await?;
                Ok::<_, anyhow::Error>(Arc::new(store) as Arc<dyn GraphGateway>)
            })
            .await
            .with_context(|| format!("connecting to {}", self.config.neo4j_uri))?;
        Ok(Arc::clone(graph))
    }

    pub async fn run_gitee_sync(&self) -> Result<JobOutcome<SyncReport>> {
        let Some(_guard) = self.flights.try_acquire(GITEE_JOB_KEY) else {
            info!(job = GITEE_JOB_KEY, "task still running, skip for now");
            return Ok(JobOutcome::Skipped);
        };
        let tracked = TrackedEntitiesFile::load(&self.config.tracked_entities_file).await?;
        let discovery = EntityDiscovery::new(
            Arc::clone(&self.columnar),
            Arc::clone(&self.transport),
            self.config.orgs_repos_table.clone(),
            self.config.gitee_api_base.clone(),
            self.config.gitee_token.clone(),
            self.config.executor_batch_size,
        );
        let entities = discovery
            .resolve(&tracked)
            .await
            .context("resolving tracked gitee entities")?;

        let controller = IncrementalSyncController::new(
            RequestExecutor::new(Arc::clone(&self.transport), self.config.executor()),
            Arc::clone(&self.columnar),
            self.config.event_table.clone(),
            Arc::new(GiteeFeed::new(
                self.config.gitee_api_base.clone(),
                self.config.gitee_token.clone(),
            )),
            Arc::from(normalizer_for(Platform::Gitee)),
            self.config.backfill_threshold(),
        );
        let report = controller.run(entities).await?;
        info!(job = GITEE_JOB_KEY, inserted = report.inserted, "task done");
        Ok(JobOutcome::Completed(report))
    }

    /// Downloads recent hourly archives (when enabled) and imports every archive not yet marked.
    pub async fn run_log_import(&self) -> Result<JobOutcome<ImportReport>> {
        let Some(_guard) = self.flights.try_acquire(LOG_IMPORT_JOB_KEY) else {
            info!(job = LOG_IMPORT_JOB_KEY, "task still running, skip for now");
            return Ok(JobOutcome::Skipped);
        };
        if self.config.download_enabled {
            let to = Utc::now();
            let from = to - TimeDelta::hours(self.config.download_lookback_hours);
            if let Err(err) = self.download(from, to).await {
                warn!(error = %format!("{err:#}"), "archive download failed; importing what is on disk");
            }
        }
        let pending = pending_archives(&self.config.data_dir).await?;
        info!(job = LOG_IMPORT_JOB_KEY, pending = pending.len(), "importing archives");
        let report = self.import_files(pending).await?;
        Ok(JobOutcome::Completed(report))
    }

    /// Materializes `files` in order, marking each fully committed file as imported.
    pub async fn import_files(&self, files: Vec<PathBuf>) -> Result<ImportReport> {
        let graph = self.graph().await?;
        let mut materializer = GraphMaterializer::new(graph, self.config.graph_chunk_size);
        let mut report = ImportReport {
            files: files.len(),
            ..Default::default()
        };

        let mut tickets = Vec::with_capacity(files.len());
        for file in &files {
            match materializer.materialize(file).await {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => {
                    error!(file = %file.display(), error = %format!("{err:#}"), "archive import failed");
                    report.failed += 1;
                }
            }
        }
        materializer.finish().await;

        for ticket in tickets {
            let file = ticket.file().to_path_buf();
            let commit = match ticket.wait().await {
                Ok(commit) => commit,
                Err(err) => {
                    error!(file = %file.display(), error = %err, "archive commit lost");
                    report.failed += 1;
                    continue;
                }
            };
            report.lines += commit.lines;
            report.skipped_lines += commit.skipped;
            report.nodes += commit.nodes;
            report.edges += commit.edges;
            if commit.is_complete() {
                report.committed += 1;
                if let Err(err) = mark_imported(&file).await {
                    error!(file = %file.display(), error = %format!("{err:#}"), "archive committed but not marked");
                    report.unmarked += 1;
                }
            } else {
                report.failed += 1;
            }
            report.reports.push(commit);
        }
        info!(
            files = report.files,
            committed = report.committed,
            failed = report.failed,
            unmarked = report.unmarked,
            "archive import finished"
        );
        Ok(report)
    }

    pub async fn download(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<DownloadReport> {
        let downloader = self
            .downloader
            .as_ref()
            .ok_or_else(|| anyhow!("archive downloads are not configured"))?;
        let jobs = ArchiveDownloader::hourly_jobs(&self.config.archive_base_url, from, to);
        info!(count = jobs.len(), %from, %to, "downloading hourly archives");
        downloader.download_all(jobs).await
    }

    /// Wipes the graph and recreates its constraints. Callers confirm with the operator first.
    pub async fn init_graph(&self) -> Result<()> {
        self.graph()
            .await?
            .reset_schema()
            .await
            .context("resetting graph schema")
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let this = Arc::clone(self);
        let cron = &self.config.gitee_cron;
        let gitee = Job::new_async(cron, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(err) = this.run_gitee_sync().await {
                    error!(job = GITEE_JOB_KEY, error = %format!("{err:#}"), "scheduled job failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(gitee).await.context("adding scheduler job")?;

        let this = Arc::clone(self);
        let cron = &self.config.log_import_cron;
        let logs = Job::new_async(cron, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(err) = this.run_log_import().await {
                    error!(job = LOG_IMPORT_JOB_KEY, error = %format!("{err:#}"), "scheduled job failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(logs).await.context("adding scheduler job")?;

        Ok(Some(sched))
    }
}

pub fn imported_marker(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(IMPORTED_MARKER_SUFFIX);
    PathBuf::from(name)
}

async fn mark_imported(archive: &Path) -> Result<()> {
    let marker = imported_marker(archive);
    fs::write(&marker, Utc::now().to_rfc3339())
        .await
        .with_context(|| format!("writing {}", marker.display()))
}

/// Hour an archive named `YYYY-MM-DD-H.json.gz` covers.
pub fn archive_hour(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(".json.gz")?;
    let (date, hour) = stem.rsplit_once('-')?;
    let hour: u32 = hour.parse().ok()?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(hour, 0, 0)?.and_utc())
}

/// Archives under `dir` without an import marker, oldest hour first.
pub async fn pending_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut pending = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(hour) = path.file_name().and_then(|n| n.to_str()).and_then(archive_hour) else {
            continue;
        };
        if fs::try_exists(imported_marker(&path)).await? {
            continue;
        }
        pending.push((hour, path));
    }
    pending.sort();
    Ok(pending.into_iter().map(|(_, path)| path).collect())
}
