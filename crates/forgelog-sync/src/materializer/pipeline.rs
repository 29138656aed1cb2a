//! Parse/commit pipeline: the next file is parsed while the previous batch is being committed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use forgelog_storage::GraphGateway;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use super::batch::GraphExport;
use super::parse::{parse_file, ParseStats};

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub file: PathBuf,
    pub lines: usize,
    pub skipped: usize,
    pub nodes: usize,
    pub edges: usize,
    pub failed_chunks: usize,
    pub parse_time: Duration,
    pub commit_time: Duration,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0
    }
}

/// Resolves once the batch handed over by `materialize` has been committed.
#[derive(Debug)]
pub struct CommitTicket {
    file: PathBuf,
    rx: oneshot::Receiver<CommitReport>,
}

impl CommitTicket {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub async fn wait(self) -> Result<CommitReport> {
        self.rx
            .await
            .map_err(|_| anyhow!("commit of {} was aborted", self.file.display()))
    }
}

pub struct GraphMaterializer {
    graph: Arc<dyn GraphGateway>,
    chunk_size: usize,
    in_flight: Option<JoinHandle<()>>,
}

impl GraphMaterializer {
    pub fn new(graph: Arc<dyn GraphGateway>, chunk_size: usize) -> Self {
        Self {
            graph,
            chunk_size,
            in_flight: None,
        }
    }

    /// Parses `path`, then starts committing it once the previous commit has finished.
    pub async fn materialize(&mut self, path: &Path) -> Result<CommitTicket> {
        let started = Instant::now();
        let owned = path.to_path_buf();
        let (batch, stats) = tokio::task::spawn_blocking(move || parse_file(&owned))
            .await
            .context("parse task panicked")?
            .with_context(|| format!("reading {}", path.display()))?;
        let parse_time = started.elapsed();

        self.wait_in_flight().await;

        let export = batch.export(self.chunk_size);
        let (tx, rx) = oneshot::channel();
        let graph = Arc::clone(&self.graph);
        let file = path.to_path_buf();
        self.in_flight = Some(tokio::spawn(async move {
            let report = commit(graph, export, file, stats, parse_time).await;
            // The ticket may have been dropped; the report is logged either way.
            let _ = tx.send(report);
        }));
        Ok(CommitTicket {
            file: path.to_path_buf(),
            rx,
        })
    }

    /// Waits for the last commit handed over by `materialize`.
    pub async fn finish(&mut self) {
        self.wait_in_flight().await;
    }

    async fn wait_in_flight(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "graph commit task failed");
            }
        }
    }
}

async fn commit(
    graph: Arc<dyn GraphGateway>,
    export: GraphExport,
    file: PathBuf,
    stats: ParseStats,
    parse_time: Duration,
) -> CommitReport {
    let started = Instant::now();
    let mut failed_chunks = 0;

    let mut nodes = JoinSet::new();
    for chunk in export.nodes {
        let graph = Arc::clone(&graph);
        nodes.spawn(async move {
            let label = chunk.node_type.label();
            graph.upsert_nodes(chunk).await.map_err(|e| (label, e))
        });
    }
    failed_chunks += join_chunks(nodes).await;

    for (phase, chunks) in export.edge_phases {
        let mut edges = JoinSet::new();
        for chunk in chunks {
            let graph = Arc::clone(&graph);
            edges.spawn(async move {
                let label = chunk.edge_type.label();
                graph.upsert_edges(chunk).await.map_err(|e| (label, e))
            });
        }
        let failed = join_chunks(edges).await;
        if failed > 0 {
            error!(phase, failed, file = %file.display(), "edge chunks failed");
        }
        failed_chunks += failed;
    }

    let report = CommitReport {
        file,
        lines: stats.lines,
        skipped: stats.skipped,
        nodes: export.node_count,
        edges: export.edge_count,
        failed_chunks,
        parse_time,
        commit_time: started.elapsed(),
    };
    info!(
        file = %report.file.display(),
        nodes = report.nodes,
        edges = report.edges,
        failed_chunks = report.failed_chunks,
        parse_ms = report.parse_time.as_millis() as u64,
        commit_ms = report.commit_time.as_millis() as u64,
        "graph batch committed"
    );
    report
}

async fn join_chunks<E: std::fmt::Display + Send + 'static>(
    mut set: JoinSet<Result<(), (&'static str, E)>>,
) -> usize {
    let mut failed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err((label, err))) => {
                error!(label, error = %err, "graph chunk upsert failed");
                failed += 1;
            }
            Err(err) => {
                error!(error = %err, "graph chunk task failed");
                failed += 1;
            }
        }
    }
    failed
}
