//! Per-job execution: dispatch, outcome handling, and the shared
//! failed-attempt rule used by both the worker pool and the reaper.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, SharedBackend};
use crate::error::Result;
use crate::job::{now_ms, ErrorData, Job, JobId, JobState, JobUpdate};
use crate::registry::{JobContext, JobRegistry, Outcome, RunError, RunResult};
use crate::retry::BackoffPolicy;

/// Cooperative-cancellation flags for jobs currently executing in this
/// process, keyed by job id. Owned by one Engine instance and shared
/// with its pools.
#[derive(Default)]
pub struct CancelRegistry {
    flags: Mutex<HashMap<i64, Arc<AtomicBool>>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flag for a job about to execute.
    pub(crate) fn register(&self, id: JobId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.lock().insert(id.0, flag.clone());
        flag
    }

    /// Drop the flag once execution finishes.
    pub(crate) fn remove(&self, id: JobId) {
        self.flags.lock().remove(&id.0);
    }

    /// Request cancellation of a running job. Best-effort: returns
    /// whether the job was executing here and got flagged.
    pub fn request(&self, id: JobId) -> bool {
        match self.flags.lock().get(&id.0) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Build the update for a failed (non-snoozed) attempt: requeue with
/// backoff while attempts remain, otherwise fail terminally. The same
/// rule covers execution errors, timeouts, and reaper-detected stale
/// jobs.
pub(crate) fn failure_update(job: &Job, error: ErrorData, backoff: &dyn BackoffPolicy) -> JobUpdate {
    let attempt = job.attempt + 1;
    if attempt < job.max_attempts {
        let available_at = now_ms() + backoff.delay(attempt).as_millis() as i64;
        JobUpdate::retry(job.id, error, attempt, available_at)
    } else {
        JobUpdate::failed(job.id, error, attempt)
    }
}

/// Executes claimed jobs and reports their outcomes to the backend.
pub(crate) struct Executor {
    backend: SharedBackend,
    registry: Arc<JobRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    cancels: Arc<CancelRegistry>,
    worker_id: String,
}

impl Executor {
    pub fn new(
        backend: SharedBackend,
        registry: Arc<JobRegistry>,
        backoff: Arc<dyn BackoffPolicy>,
        cancels: Arc<CancelRegistry>,
        worker_id: String,
    ) -> Self {
        Self {
            backend,
            registry,
            backoff,
            cancels,
            worker_id,
        }
    }

    /// Run one claimed job to an outcome. Execution errors are
    /// absorbed into the job row; only backend faults surface in the
    /// log.
    pub async fn execute(&self, job: Job) {
        let id = job.id;
        let cancel = self.cancels.register(id);
        if let Err(e) = self.execute_inner(job, cancel).await {
            tracing::error!(job_id = %id, error = %e, "Failed to record job outcome");
        }
        self.cancels.remove(id);
    }

    async fn execute_inner(&self, job: Job, cancel: Arc<AtomicBool>) -> Result<()> {
        let started = now_ms();
        let row = self.backend.update_job(JobUpdate::running(job.id)).await?;
        if row.state != JobState::Running {
            // Canceled between claim and dispatch.
            tracing::debug!(job_id = %job.id, state = %row.state, "Skipping job no longer runnable");
            return Ok(());
        }

        tracing::debug!(
            job_id = %job.id,
            queue = %job.queue,
            class = %job.class,
            attempt = job.attempt,
            "Processing job"
        );

        let ctx = JobContext::new(job.id, job.queue.clone(), job.attempt, cancel);
        let result = self.run_attempt(&job, &ctx).await;

        match result {
            Ok(Outcome::Complete(value)) => {
                self.backend
                    .update_job(JobUpdate::completed(job.id, value, job.attempt + 1))
                    .await?;
                tracing::debug!(job_id = %job.id, "Job completed");
            }
            Ok(Outcome::Snooze(delay)) => {
                let available_at = now_ms() + delay.as_millis() as i64;
                self.backend
                    .update_job(JobUpdate::snoozed(job.id, available_at))
                    .await?;
                tracing::debug!(
                    job_id = %job.id,
                    available_at = available_at,
                    "Job snoozed"
                );
            }
            Err(err) => {
                let error = ErrorData {
                    name: err.name,
                    message: err.message,
                    stack: err.stack,
                    attempt: job.attempt + 1,
                    attempted_at: started,
                    attempt_by: self.worker_id.clone(),
                };
                let update = failure_update(&job, error, &*self.backoff);
                let failed = matches!(update.state, Some(JobState::Failed));
                let updated = self.backend.update_job(update).await?;

                if failed {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = updated.attempt,
                        "Job failed terminally"
                    );
                } else {
                    tracing::debug!(
                        job_id = %job.id,
                        attempt = updated.attempt,
                        available_at = updated.available_at,
                        "Job scheduled for retry"
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_attempt(&self, job: &Job, ctx: &JobContext) -> RunResult {
        let run = async {
            let runnable = self
                .registry
                .instantiate(&job.class, &job.constructor_args)
                .map_err(|e| RunError::new("ValidationError", e.to_string()))?;
            runnable.run(ctx, &job.args).await
        };

        match job.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => Err(RunError::new(
                    "TimeoutError",
                    format!("attempt exceeded timeout of {}ms", timeout.as_millis()),
                )),
            },
            None => run.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ExponentialBackoff;
    use std::time::Duration;

    fn job_with_attempts(attempt: u32, max_attempts: u32) -> Job {
        Job {
            id: JobId(1),
            queue: "q".to_string(),
            state: JobState::Running,
            class: "c".to_string(),
            args: vec![],
            constructor_args: vec![],
            attempt,
            max_attempts,
            timeout: None,
            result: None,
            errors: vec![],
            inserted_at: now_ms(),
            available_at: now_ms(),
            attempted_at: Some(now_ms()),
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            claimed_by: Some("w".to_string()),
            claimed_at: Some(now_ms()),
            unique_digest: None,
            uniqueness: None,
        }
    }

    fn sample_error(attempt: u32) -> ErrorData {
        ErrorData {
            name: "RunError".to_string(),
            message: "boom".to_string(),
            stack: None,
            attempt,
            attempted_at: now_ms(),
            attempt_by: "w".to_string(),
        }
    }

    #[test]
    fn test_failure_update_requeues_while_attempts_remain() {
        let backoff = ExponentialBackoff::fixed(Duration::from_secs(5));
        let job = job_with_attempts(0, 3);
        let before = now_ms();
        let update = failure_update(&job, sample_error(1), &backoff);
        assert_eq!(update.state, Some(JobState::Waiting));
        assert_eq!(update.attempt, Some(1));
        assert!(update.available_at.unwrap() >= before + 5_000);
        assert!(update.failed_at.is_none());
    }

    #[test]
    fn test_failure_update_fails_on_last_attempt() {
        let backoff = ExponentialBackoff::fixed(Duration::from_secs(5));
        let job = job_with_attempts(2, 3);
        let update = failure_update(&job, sample_error(3), &backoff);
        assert_eq!(update.state, Some(JobState::Failed));
        assert_eq!(update.attempt, Some(3));
        assert!(update.failed_at.is_some());
    }

    #[test]
    fn test_failure_update_single_attempt_job() {
        let backoff = ExponentialBackoff::fixed(Duration::from_secs(5));
        let job = job_with_attempts(0, 1);
        let update = failure_update(&job, sample_error(1), &backoff);
        assert_eq!(update.state, Some(JobState::Failed));
    }

    #[test]
    fn test_cancel_registry_flags() {
        let cancels = CancelRegistry::new();
        let flag = cancels.register(JobId(7));
        assert!(!flag.load(Ordering::SeqCst));

        assert!(cancels.request(JobId(7)));
        assert!(flag.load(Ordering::SeqCst));

        cancels.remove(JobId(7));
        assert!(!cancels.request(JobId(7)));
    }
}
