//! In-memory backend.
//!
//! Reference implementation of the [`Backend`] contract over a mutex-
//! guarded map. All mutation happens under a single lock, which gives
//! the contract's per-row and per-claim-batch atomicity for free. Used
//! by the engine's test suite and useful for local development; it
//! provides no durability.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    Backend, JobFilter, NewQueue, QueueConfig, QueueState, QueueUpdate, StateCounts, TimeRange,
};
use crate::error::{QuarryError, Result};
use crate::job::{now_ms, Job, JobId, JobState, JobUpdate, NewJob};

#[derive(Default)]
struct Inner {
    next_job_id: i64,
    next_queue_id: i64,
    jobs: BTreeMap<i64, Job>,
    queues: HashMap<String, QueueConfig>,
}

/// In-memory [`Backend`] implementation.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock();

        if let Some(digest) = &new.unique_digest {
            let conflict = inner
                .jobs
                .values()
                .any(|j| !j.state.is_terminal() && j.unique_digest.as_deref() == Some(digest));
            if conflict {
                return Err(QuarryError::DuplicateJob {
                    class: new.class,
                    digest: digest.clone(),
                });
            }
        }

        inner.next_job_id += 1;
        let id = inner.next_job_id;
        let now = now_ms();
        let job = Job {
            id: JobId(id),
            queue: new.queue,
            state: new.state.unwrap_or(JobState::Waiting),
            class: new.class,
            args: new.args,
            constructor_args: new.constructor_args,
            attempt: 0,
            max_attempts: new.max_attempts,
            timeout: new.timeout,
            result: None,
            errors: Vec::new(),
            inserted_at: now,
            available_at: new.available_at.unwrap_or(now),
            attempted_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            claimed_by: None,
            claimed_at: None,
            unique_digest: new.unique_digest,
            uniqueness: new.uniqueness,
        };
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id.0).cloned())
    }

    async fn claim_pending(&self, queue: &str, quantity: usize, worker: &str) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock();
        let now = now_ms();

        let mut eligible: Vec<(i64, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Waiting && j.available_at <= now)
            .map(|j| (j.inserted_at, j.id.0))
            .collect();
        eligible.sort_unstable();

        let mut claimed = Vec::with_capacity(quantity.min(eligible.len()));
        for (_, id) in eligible.into_iter().take(quantity) {
            let job = inner.jobs.get_mut(&id).expect("eligible job exists");
            job.state = JobState::Claimed;
            job.claimed_at = Some(now);
            job.claimed_by = Some(worker.to_string());
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn update_job(&self, update: JobUpdate) -> Result<Job> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&update.id.0)
            .ok_or(QuarryError::NotFound(update.id))?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let jobs = inner
            .jobs
            .values()
            .rev()
            .filter(|j| filter.queue.as_deref().map_or(true, |q| j.queue == q))
            .filter(|j| filter.state.map_or(true, |s| j.state == s))
            .filter(|j| filter.class.as_deref().map_or(true, |c| j.class == c))
            .skip(filter.offset)
            .take(filter.effective_limit())
            .cloned()
            .collect();
        Ok(jobs)
    }

    async fn count_jobs(&self, range: &TimeRange) -> Result<StateCounts> {
        let inner = self.inner.lock();
        let mut counts = StateCounts::default();
        for job in inner.jobs.values() {
            if range.contains(job.inserted_at) {
                counts.add(job.state);
            }
        }
        Ok(counts)
    }

    async fn count_jobs_by_queue(&self) -> Result<HashMap<String, StateCounts>> {
        let inner = self.inner.lock();
        let mut by_queue: HashMap<String, StateCounts> = HashMap::new();
        for job in inner.jobs.values() {
            by_queue.entry(job.queue.clone()).or_default().add(job.state);
        }
        Ok(by_queue)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .jobs
            .values()
            .map(|j| j.queue.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn insert_queue(&self, queue: NewQueue) -> Result<QueueConfig> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.queues.get(&queue.name) {
            return Ok(existing.clone());
        }
        inner.next_queue_id += 1;
        let config = QueueConfig {
            id: inner.next_queue_id,
            name: queue.name.clone(),
            concurrency: queue.concurrency,
            priority: queue.priority,
            state: QueueState::Active,
        };
        inner.queues.insert(queue.name, config.clone());
        Ok(config)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueConfig>> {
        Ok(self.inner.lock().queues.get(name).cloned())
    }

    async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        let inner = self.inner.lock();
        let mut queues: Vec<QueueConfig> = inner.queues.values().cloned().collect();
        queues.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        Ok(queues)
    }

    async fn update_queue(&self, update: QueueUpdate) -> Result<QueueConfig> {
        let mut inner = self.inner.lock();
        let queue = inner
            .queues
            .get_mut(&update.name)
            .ok_or_else(|| QuarryError::Validation(format!("unknown queue '{}'", update.name)))?;
        if let Some(concurrency) = update.concurrency {
            queue.concurrency = concurrency;
        }
        if let Some(priority) = update.priority {
            queue.priority = priority;
        }
        if let Some(state) = update.state {
            queue.state = state;
        }
        Ok(queue.clone())
    }

    async fn stale_jobs(&self, max_claimed: Duration, max_running: Duration) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let now = now_ms();
        let claimed_cutoff = now - max_claimed.as_millis() as i64;
        let default_running = max_running.as_millis() as i64;

        let stale = inner
            .jobs
            .values()
            .filter(|j| match j.state {
                JobState::Claimed => j.claimed_at.map_or(false, |at| at <= claimed_cutoff),
                JobState::Running => j.attempted_at.map_or(false, |at| {
                    let limit = j
                        .timeout
                        .map(|t| t.as_millis() as i64)
                        .unwrap_or(default_running);
                    at + limit <= now
                }),
                _ => false,
            })
            .cloned()
            .collect();
        Ok(stale)
    }

    async fn delete_finished_jobs(&self, cutoff: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| !matches!(j.finished_at(), Some(at) if at < cutoff));
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.jobs.clear();
        inner.queues.clear();
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback_migration(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
