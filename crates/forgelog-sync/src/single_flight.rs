//! Process-wide registry of job keys that are currently running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    running: Arc<Mutex<HashSet<String>>>,
}

/// Held while a keyed job runs; dropping it frees the key.
#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    registry: SingleFlight,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `key`, or returns `None` when a job with the same key is still running.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        if !self.lock().insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard {
            key: key.to_string(),
            registry: self.clone(),
        })
    }

    fn release(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_guard_drops() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire("GiteeImporterTask").unwrap();
        assert!(flights.try_acquire("GiteeImporterTask").is_none());
        assert!(flights.try_acquire("GitHubImporterTask").is_some());
        assert!(flights.is_running("GiteeImporterTask"));

        drop(guard);
        assert!(!flights.is_running("GiteeImporterTask"));
        assert!(flights.try_acquire("GiteeImporterTask").is_some());
    }

    #[test]
    fn reacquired_key_belongs_to_the_new_guard() {
        let flights = SingleFlight::new();
        drop(flights.try_acquire("GitHubImporterTask").unwrap());
        let current = flights.try_acquire("GitHubImporterTask").unwrap();
        assert_eq!(current.key(), "GitHubImporterTask");
        assert!(flights.try_acquire("GitHubImporterTask").is_none());
        assert!(flights.is_running("GitHubImporterTask"));
        drop(current);
        assert!(!flights.is_running("GitHubImporterTask"));
    }

    #[tokio::test]
    async fn guard_released_when_job_task_panics() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire("job").unwrap();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("job failed");
        });
        assert!(handle.await.is_err());
        assert!(!flights.is_running("job"));
    }
}
