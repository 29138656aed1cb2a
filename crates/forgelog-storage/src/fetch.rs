//! Single-request HTTP transport used by the request executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Whether a failed attempt is worth repeating.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Retry count and pause for one executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, interval: Duration) -> Self {
        Self { max_retries, interval }
    }

    /// Pause before the next attempt; a server-provided `Retry-After` wins when longer.
    pub fn pause(&self, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if hint > self.interval => hint,
            _ => self.interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request deadline; `None` leaves the deadline to the caller.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
            max_in_flight: 32,
            rate_limit: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }
}

/// At most `requests` request starts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
}

/// Fixed-window limiter shared by every request of one fetcher.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    window: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let elapsed = window.0.elapsed();
                if elapsed >= self.limit.window {
                    *window = (Instant::now(), 0);
                }
                if window.1 < self.limit.requests.max(1) {
                    window.1 += 1;
                    return;
                }
                self.limit.window.saturating_sub(window.0.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Issues one logical request, retrying per `policy`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            limiter: config.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit))),
        })
    }

    async fn attempt(&self, method: &Method, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        self.client.request(method.clone(), url).send().await
    }

    async fn execute_with_retries(
        &self,
        method: Method,
        url: &str,
        policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            let retry_after = match self.attempt(&method, url).await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse { status, final_url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable_status(status) || attempt >= policy.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    retry_after_hint(&resp)
                }
                Err(err) => {
                    if !is_retryable_error(&err) || attempt >= policy.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    None
                }
            };
            attempt += 1;
            debug!(attempt, "retrying request");
            tokio::time::sleep(policy.pause(retry_after)).await;
        }
    }
}

fn retry_after_hint(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %method, url);
        self.execute_with_retries(method, url, policy)
            .instrument(span)
            .await
    }
}
