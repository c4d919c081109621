//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::DEFAULT_CONCURRENCY;
use crate::error::{QuarryError, Result};
use crate::retry::{BackoffPolicy, ExponentialBackoff};

/// Declaration of a queue the engine should service.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Maximum concurrently running jobs for the queue.
    pub concurrency: u32,
    /// Startup ordering weight; higher starts first.
    pub priority: i32,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            priority: 0,
        }
    }

    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Tunables for one engine instance.
#[derive(Clone)]
pub struct EngineConfig {
    /// Queues this engine services, with their concurrency limits.
    pub queues: Vec<QueueSpec>,
    /// Delay between claim attempts when a queue is idle.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per poll per queue.
    pub batch_size: usize,
    /// Delay between reaper sweeps.
    pub reaper_interval: Duration,
    /// Age after which a claimed-but-never-started job is stale.
    pub max_claimed: Duration,
    /// Running ceiling for jobs without their own timeout.
    pub max_running: Duration,
    /// How long terminal jobs are kept before the reaper purges them.
    pub retention: Duration,
    /// How long close() waits for in-flight jobs to drain.
    pub shutdown_timeout: Duration,
    /// Worker identity recorded on claims. Defaults to
    /// hostname-pid-timestamp when unset.
    pub worker_id: Option<String>,
    /// Retry delay policy.
    pub backoff: Arc<dyn BackoffPolicy>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("queues", &self.queues)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .field("reaper_interval", &self.reaper_interval)
            .field("max_claimed", &self.max_claimed)
            .field("max_running", &self.max_running)
            .field("retention", &self.retention)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            reaper_interval: Duration::from_secs(30),
            max_claimed: Duration::from_secs(300),
            max_running: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600),
            shutdown_timeout: Duration::from_secs(30),
            worker_id: None,
            backoff: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue with default concurrency and priority.
    pub fn queue(self, name: impl Into<String>) -> Self {
        self.queue_spec(QueueSpec::new(name))
    }

    /// Add a fully specified queue.
    pub fn queue_spec(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn max_claimed(mut self, max_claimed: Duration) -> Self {
        self.max_claimed = max_claimed;
        self
    }

    pub fn max_running(mut self, max_running: Duration) -> Self {
        self.max_running = max_running;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QuarryError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(QuarryError::Config(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(QuarryError::Config(
                "reaper_interval must be non-zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.queues {
            if spec.name.is_empty() {
                return Err(QuarryError::Config("queue name must not be empty".to_string()));
            }
            if spec.concurrency == 0 {
                return Err(QuarryError::Config(format!(
                    "queue '{}' concurrency must be at least 1",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(QuarryError::Config(format!(
                    "queue '{}' declared more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chains() {
        let config = EngineConfig::new()
            .queue("default")
            .queue_spec(QueueSpec::new("mail").concurrency(2).priority(5))
            .poll_interval(Duration::from_millis(100))
            .batch_size(4)
            .worker_id("w-1");
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[1].concurrency, 2);
        assert_eq!(config.queues[1].priority, 5);
        assert_eq!(config.worker_id.as_deref(), Some("w-1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = EngineConfig::new().batch_size(0).validate().unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_concurrency_queue() {
        let err = EngineConfig::new()
            .queue_spec(QueueSpec::new("q").concurrency(0))
            .validate()
            .unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }

    #[test]
    fn test_rejects_duplicate_queue() {
        let err = EngineConfig::new()
            .queue("q")
            .queue("q")
            .validate()
            .unwrap_err();
        assert!(matches!(err, QuarryError::Config(_)));
    }
}
