//! Bounded-concurrency request queue whose handlers may enqueue follow-up requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::{FetchError, FetchedResponse, RetryPolicy, Transport};

#[derive(Debug, Clone)]
pub struct FetchTask<T> {
    pub method: Method,
    pub url: String,
    pub user_data: T,
}

impl<T> FetchTask<T> {
    pub fn get(url: impl Into<String>, user_data: T) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            user_data,
        }
    }
}

/// Handle given to response handlers for scheduling more work in the same drain.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tx: mpsc::UnboundedSender<FetchTask<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn push(&self, task: FetchTask<T>) {
        // The receiver lives for the whole drain, so a send can only fail after it returned.
        if self.tx.send(task).is_err() {
            error!("task pushed after executor drain completed");
        }
    }
}

#[async_trait]
pub trait ResponseHandler<T>: Send + Sync {
    /// Called once per finished task; pushes onto `queue` are drained before `drain` returns.
    async fn on_response(
        &self,
        outcome: Result<FetchedResponse, FetchError>,
        task: FetchTask<T>,
        queue: &TaskQueue<T>,
    );
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub batch_size: usize,
    pub retries: usize,
    pub retry_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            batch_size: 30,
            retries: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    options: ExecutorOptions,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, options: ExecutorOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> ExecutorOptions {
        self.options
    }

    /// Runs `initial` and everything the handler enqueues, at most `batch_size` at a time.
    pub async fn drain<T, H>(&self, initial: Vec<FetchTask<T>>, handler: Arc<H>) -> ExecutorStats
    where
        T: Send + 'static,
        H: ResponseHandler<T> + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue { tx };
        for task in initial {
            queue.push(task);
        }

        let policy = RetryPolicy::new(self.options.retries, self.options.retry_interval);
        let limit = self.options.batch_size.max(1);
        let mut in_flight: JoinSet<bool> = JoinSet::new();
        let mut stats = ExecutorStats::default();

        loop {
            while in_flight.len() < limit {
                let Ok(task) = rx.try_recv() else {
                    break;
                };
                let transport = Arc::clone(&self.transport);
                let handler = Arc::clone(&handler);
                let queue = queue.clone();
                in_flight.spawn(async move {
                    let outcome = transport.execute(task.method.clone(), &task.url, &policy).await;
                    let ok = outcome.is_ok();
                    handler.on_response(outcome, task, &queue).await;
                    ok
                });
            }

            // Handlers push before their task completes, so an empty set with an empty
            // channel means no more work can appear.
            match in_flight.join_next().await {
                None => break,
                Some(Ok(true)) => stats.succeeded += 1,
                Some(Ok(false)) => stats.failed += 1,
                Some(Err(err)) => {
                    error!(error = %err, "fetch task panicked");
                    stats.failed += 1;
                }
            }
        }

        debug!(succeeded = stats.succeeded, failed = stats.failed, "executor drained");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTransport {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn execute(
            &self,
            _method: Method,
            url: &str,
            _policy: &RetryPolicy,
        ) -> Result<FetchedResponse, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if url.ends_with("/missing") {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                });
            }
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: url.as_bytes().to_vec(),
            })
        }
    }

    /// Re-enqueues each task with a decremented depth until it hits zero.
    struct ChainHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResponseHandler<u32> for ChainHandler {
        async fn on_response(
            &self,
            outcome: Result<FetchedResponse, FetchError>,
            task: FetchTask<u32>,
            queue: &TaskQueue<u32>,
        ) {
            self.seen.lock().unwrap().push(task.url.clone());
            if outcome.is_ok() && task.user_data > 0 {
                queue.push(FetchTask::get(
                    format!("{}/next", task.url),
                    task.user_data - 1,
                ));
            }
        }
    }

    fn transport() -> Arc<CountingTransport> {
        Arc::new(CountingTransport {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn drain_waits_for_transitively_pushed_tasks() {
        let executor = RequestExecutor::new(transport(), ExecutorOptions::default());
        let handler = Arc::new(ChainHandler {
            seen: Mutex::new(Vec::new()),
        });
        let stats = executor
            .drain(
                vec![FetchTask::get("a", 2), FetchTask::get("b", 0)],
                Arc::clone(&handler),
            )
            .await;

        assert_eq!(stats.succeeded, 4);
        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "a/next", "a/next/next", "b"]);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_batch_size() {
        let transport = transport();
        let executor = RequestExecutor::new(
            transport.clone(),
            ExecutorOptions {
                batch_size: 3,
                ..ExecutorOptions::default()
            },
        );
        let handler = Arc::new(ChainHandler {
            seen: Mutex::new(Vec::new()),
        });
        let tasks = (0..10).map(|i| FetchTask::get(format!("t{i}"), 0)).collect();
        let stats = executor.drain(tasks, handler).await;

        assert_eq!(stats.succeeded, 10);
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failed_tasks_are_reported_to_the_handler() {
        let executor = RequestExecutor::new(transport(), ExecutorOptions::default());
        let handler = Arc::new(ChainHandler {
            seen: Mutex::new(Vec::new()),
        });
        let stats = executor
            .drain(vec![FetchTask::get("x/missing", 5)], Arc::clone(&handler))
            .await;

        assert_eq!(stats, ExecutorStats { succeeded: 0, failed: 1 });
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }
}
