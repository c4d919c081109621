//! Backend abstraction for job and queue storage.
//!
//! The engine depends only on this trait; any storage that can provide
//! per-row (and per-claim-batch) atomic operations can serve as the
//! durability layer. No operation may assume a distributed transaction
//! spanning multiple calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobId, JobState, JobUpdate, NewJob};

/// Concurrency limit applied to queues that do not declare their own.
pub const DEFAULT_CONCURRENCY: u32 = 10;

/// Queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Serviced by worker pools.
    Active,
    /// Jobs accumulate but are not claimed.
    Paused,
}

/// Per-queue configuration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend-assigned identifier.
    pub id: i64,
    /// Unique queue name.
    pub name: String,
    /// Maximum simultaneously running jobs for this queue.
    pub concurrency: u32,
    /// Queues with higher priority are serviced first.
    pub priority: i32,
    /// Active or paused.
    pub state: QueueState,
}

/// Insert payload for a queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueue {
    /// Unique queue name.
    pub name: String,
    /// Concurrency limit; defaults to [`DEFAULT_CONCURRENCY`].
    pub concurrency: u32,
    /// Servicing priority; defaults to 0.
    pub priority: i32,
}

impl NewQueue {
    /// Create a queue definition with the documented defaults
    /// ([`DEFAULT_CONCURRENCY`], priority 0).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            priority: 0,
        }
    }

    /// Set the concurrency limit.
    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the servicing priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Partial update for a queue configuration, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueUpdate {
    /// Target queue name.
    pub name: String,
    /// New concurrency limit.
    pub concurrency: Option<u32>,
    /// New priority.
    pub priority: Option<i32>,
    /// New state (pause/resume).
    pub state: Option<QueueState>,
}

impl QueueUpdate {
    /// An empty update for the named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            priority: None,
            state: None,
        }
    }

    /// Pause the queue.
    pub fn pause(name: impl Into<String>) -> Self {
        Self {
            state: Some(QueueState::Paused),
            ..Self::new(name)
        }
    }

    /// Resume the queue.
    pub fn resume(name: impl Into<String>) -> Self {
        Self {
            state: Some(QueueState::Active),
            ..Self::new(name)
        }
    }
}

/// Filters for listing jobs. Results are ordered by id descending
/// (newest first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Restrict to one state.
    pub state: Option<JobState>,
    /// Restrict to one job class.
    pub class: Option<String>,
    /// Page size; 0 means the backend default of 100.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

impl JobFilter {
    /// The effective page size.
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            100
        } else {
            self.limit
        }
    }
}

/// Inclusive-from, exclusive-to bounds on `inserted_at` for counting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeRange {
    /// Lower bound (epoch ms), unbounded when `None`.
    pub since: Option<i64>,
    /// Upper bound (epoch ms), unbounded when `None`.
    pub until: Option<i64>,
}

impl TimeRange {
    /// An unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether the timestamp falls within the range.
    pub fn contains(&self, ts: i64) -> bool {
        self.since.map_or(true, |s| ts >= s) && self.until.map_or(true, |u| ts < u)
    }
}

/// Job counts grouped by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub claimed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl StateCounts {
    /// Add one job in the given state.
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Claimed => self.claimed += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Canceled => self.canceled += 1,
        }
    }

    /// Add `n` jobs in the given state.
    pub fn add_n(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Claimed => self.claimed += n,
            JobState::Running => self.running += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Canceled => self.canceled += n,
        }
    }

    /// Total jobs across all states.
    pub fn total(&self) -> u64 {
        self.waiting + self.claimed + self.running + self.completed + self.failed + self.canceled
    }
}

/// Backend trait for job and queue storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`), and every
/// method must be atomic with respect to the single row or single
/// claim batch it touches. The claim operation is the only place
/// where overlap between concurrent callers must be architecturally
/// prevented; everywhere else a job is held by exactly one worker
/// identity.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Job Operations ==========

    /// Insert a new job with defaults applied (`attempt = 0`,
    /// `state = waiting` unless specified, `available_at = now` if
    /// absent).
    ///
    /// Fails with [`QuarryError::DuplicateJob`] when `unique_digest`
    /// collides with a non-terminal job. The uniqueness check must be
    /// atomic with the insert.
    ///
    /// [`QuarryError::DuplicateJob`]: crate::error::QuarryError::DuplicateJob
    async fn create_job(&self, new: NewJob) -> Result<Job>;

    /// Fetch a job by id.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically claim up to `quantity` jobs from `queue`.
    ///
    /// Selects jobs with `state = waiting` and `available_at <= now`,
    /// FIFO by `inserted_at` (id as tiebreak), transitions each to
    /// `claimed`, stamps `claimed_at`/`claimed_by`, and returns the
    /// updated rows. Two concurrent callers must partition the waiting
    /// set disjointly: the same job is never returned twice. Returns
    /// fewer than `quantity` only when fewer are eligible; never
    /// blocks.
    async fn claim_pending(&self, queue: &str, quantity: usize, worker: &str) -> Result<Vec<Job>>;

    /// Apply a partial update to a single job row.
    ///
    /// Fails with [`QuarryError::NotFound`] when the id does not
    /// exist. Updates against a job already in a terminal state are
    /// ignored and return the stored row unchanged; entering a
    /// terminal state clears `unique_digest` atomically with the
    /// write (see [`JobUpdate::apply`]).
    ///
    /// [`QuarryError::NotFound`]: crate::error::QuarryError::NotFound
    async fn update_job(&self, update: JobUpdate) -> Result<Job>;

    /// List jobs matching the filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Count jobs by state, restricted to `inserted_at` within the
    /// range.
    async fn count_jobs(&self, range: &TimeRange) -> Result<StateCounts>;

    /// Count jobs by state, grouped by queue name.
    async fn count_jobs_by_queue(&self) -> Result<HashMap<String, StateCounts>>;

    /// Distinct queue names that have any job rows (a queue with jobs
    /// need not have a QueueConfig row).
    async fn queue_names(&self) -> Result<Vec<String>>;

    // ========== Queue Configuration ==========

    /// Insert a queue configuration. Idempotent: if the name already
    /// exists the stored row is returned unchanged.
    async fn insert_queue(&self, queue: NewQueue) -> Result<QueueConfig>;

    /// Fetch a queue configuration by name.
    async fn get_queue(&self, name: &str) -> Result<Option<QueueConfig>>;

    /// List all queue configurations, highest priority first.
    async fn list_queues(&self) -> Result<Vec<QueueConfig>>;

    /// Apply a partial update to a queue configuration.
    ///
    /// Fails with a `Validation` error when no queue with that name
    /// exists.
    async fn update_queue(&self, update: QueueUpdate) -> Result<QueueConfig>;

    // ========== Maintenance ==========

    /// Jobs stuck in transient states: `claimed` longer than
    /// `max_claimed`, or `running` longer than their own `timeout`
    /// (falling back to `max_running` when unset).
    async fn stale_jobs(&self, max_claimed: Duration, max_running: Duration) -> Result<Vec<Job>>;

    /// Delete jobs whose terminal timestamp is older than `cutoff`
    /// (epoch ms). Never touches non-terminal jobs. Returns the number
    /// of rows removed.
    async fn delete_finished_jobs(&self, cutoff: i64) -> Result<u64>;

    // ========== Schema / Lifecycle ==========

    /// Remove all job and queue rows.
    async fn truncate(&self) -> Result<()>;

    /// Run pending schema migrations.
    async fn migrate(&self) -> Result<()>;

    /// Roll the schema back one migration.
    async fn rollback_migration(&self) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around `Arc<dyn Backend>` for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Wrap an already-shared backend.
    pub fn from_arc(inner: DynBackend) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        self.inner.create_job(new).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn claim_pending(&self, queue: &str, quantity: usize, worker: &str) -> Result<Vec<Job>> {
        self.inner.claim_pending(queue, quantity, worker).await
    }

    async fn update_job(&self, update: JobUpdate) -> Result<Job> {
        self.inner.update_job(update).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.list_jobs(filter).await
    }

    async fn count_jobs(&self, range: &TimeRange) -> Result<StateCounts> {
        self.inner.count_jobs(range).await
    }

    async fn count_jobs_by_queue(&self) -> Result<HashMap<String, StateCounts>> {
        self.inner.count_jobs_by_queue().await
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        self.inner.queue_names().await
    }

    async fn insert_queue(&self, queue: NewQueue) -> Result<QueueConfig> {
        self.inner.insert_queue(queue).await
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueConfig>> {
        self.inner.get_queue(name).await
    }

    async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        self.inner.list_queues().await
    }

    async fn update_queue(&self, update: QueueUpdate) -> Result<QueueConfig> {
        self.inner.update_queue(update).await
    }

    async fn stale_jobs(&self, max_claimed: Duration, max_running: Duration) -> Result<Vec<Job>> {
        self.inner.stale_jobs(max_claimed, max_running).await
    }

    async fn delete_finished_jobs(&self, cutoff: i64) -> Result<u64> {
        self.inner.delete_finished_jobs(cutoff).await
    }

    async fn truncate(&self) -> Result<()> {
        self.inner.truncate().await
    }

    async fn migrate(&self) -> Result<()> {
        self.inner.migrate().await
    }

    async fn rollback_migration(&self) -> Result<()> {
        self.inner.rollback_migration().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_queue_defaults() {
        let q = NewQueue::new("default");
        assert_eq!(q.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(q.priority, 0);
    }

    #[test]
    fn test_default_concurrency_shared_with_queue_spec() {
        let spec = crate::config::QueueSpec::new("default");
        assert_eq!(spec.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_queue_update_pause_resume() {
        let pause = QueueUpdate::pause("mail");
        assert_eq!(pause.state, Some(QueueState::Paused));
        let resume = QueueUpdate::resume("mail");
        assert_eq!(resume.state, Some(QueueState::Active));
        assert!(resume.concurrency.is_none());
    }

    #[test]
    fn test_job_filter_effective_limit() {
        assert_eq!(JobFilter::default().effective_limit(), 100);
        let filter = JobFilter {
            limit: 5,
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), 5);
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange {
            since: Some(100),
            until: Some(200),
        };
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert!(!range.contains(99));
        assert!(TimeRange::all().contains(i64::MIN));
    }

    #[test]
    fn test_state_counts() {
        let mut counts = StateCounts::default();
        counts.add(JobState::Waiting);
        counts.add(JobState::Waiting);
        counts.add(JobState::Failed);
        counts.add_n(JobState::Completed, 3);
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.total(), 6);
    }
}
