//! Hourly event archive downloads with a bounded worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::HttpClientConfig;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("writing archive: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloaded { bytes: u64, content_hash: String },
    AlreadyPresent,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub already_present: usize,
    pub not_found: usize,
    pub timed_out: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveDownloader {
    client: reqwest::Client,
    root: PathBuf,
    workers: usize,
    timeout: Duration,
}

impl ArchiveDownloader {
    pub fn new(
        client: reqwest::Client,
        root: impl Into<PathBuf>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            root: root.into(),
            workers: workers.max(1),
            timeout,
        }
    }

    /// Builds a downloader with its own client whose only deadline is the per-archive `timeout`.
    pub fn from_config(
        http: &HttpClientConfig,
        root: impl Into<PathBuf>,
        workers: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = HttpClientConfig {
            timeout: None,
            ..http.clone()
        }
        .build_client()?;
        Ok(Self::new(client, root, workers, timeout))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Archive naming scheme: `2024-01-05-7.json.gz` (hour not zero padded).
    pub fn hourly_file_name(hour: DateTime<Utc>) -> String {
        format!("{}-{}.json.gz", hour.format("%Y-%m-%d"), hour.hour())
    }

    /// One job per hour in `[from, to)`, both truncated to the hour.
    pub fn hourly_jobs(base_url: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DownloadJob> {
        let base = base_url.trim_end_matches('/');
        let mut jobs = Vec::new();
        let mut hour = truncate_to_hour(from);
        let end = truncate_to_hour(to);
        while hour < end {
            let file_name = Self::hourly_file_name(hour);
            jobs.push(DownloadJob {
                url: format!("{base}/{file_name}"),
                file_name,
            });
            hour += ChronoDuration::hours(1);
        }
        jobs
    }

    pub fn target_path(&self, job: &DownloadJob) -> PathBuf {
        self.root.join(&job.file_name)
    }

    /// Fetches one archive into a temp file and renames it into place.
    async fn download_one(
        &self,
        job: &DownloadJob,
        partial: &Path,
    ) -> Result<DownloadStatus, DownloadError> {
        let target = self.target_path(job);
        if fs::try_exists(&target).await? {
            return Ok(DownloadStatus::AlreadyPresent);
        }

        let mut resp = self.client.get(&job.url).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(DownloadStatus::NotFound);
        }
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: job.url.clone(),
            });
        }

        let mut file = fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(partial, &target).await?;
        Ok(DownloadStatus::Downloaded {
            bytes,
            content_hash: hex::encode(hasher.finalize()),
        })
    }

    /// Downloads every job; a job that exceeds the timeout is abandoned and its partial file removed.
    pub async fn download_all(&self, jobs: Vec<DownloadJob>) -> anyhow::Result<DownloadReport> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating data directory {}", self.root.display()))?;

        let limit = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for job in jobs {
            let this = self.clone();
            let limit = Arc::clone(&limit);
            set.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let partial = this.root.join(format!(".{}.{}.tmp", job.file_name, uuid::Uuid::new_v4()));
                let outcome = tokio::time::timeout(this.timeout, this.download_one(&job, &partial)).await;
                let result = match outcome {
                    Ok(Ok(status)) => Ok(status),
                    Ok(Err(err)) => Err(Some(err)),
                    Err(_) => Err(None),
                };
                if result.is_err() {
                    remove_partial(&partial).await;
                }
                (job, result)
            });
        }

        let mut report = DownloadReport::default();
        while let Some(joined) = set.join_next().await {
            let (job, result) = joined.context("download task panicked")?;
            match result {
                Ok(DownloadStatus::Downloaded { bytes, content_hash }) => {
                    info!(file = %job.file_name, bytes, %content_hash, "archive downloaded");
                    report.downloaded += 1;
                }
                Ok(DownloadStatus::AlreadyPresent) => report.already_present += 1,
                Ok(DownloadStatus::NotFound) => {
                    warn!(url = %job.url, "archive not published");
                    report.not_found += 1;
                }
                Err(None) => {
                    warn!(url = %job.url, timeout = ?self.timeout, "archive download timed out");
                    report.timed_out += 1;
                }
                Err(Some(err)) => {
                    warn!(url = %job.url, error = %err, "archive download failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial archive"),
    }
}
