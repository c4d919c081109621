//! Stale-job recovery and finished-job retention.
//!
//! A periodic sweep that returns jobs stranded by crashed or vanished
//! workers to the regular retry path, and purges terminal jobs past
//! the retention window. One reaper per engine; multiple reapers
//! against the same backend are safe because rescue goes through the
//! same update path as ordinary failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::backend::{Backend, SharedBackend};
use crate::job::{now_ms, ErrorData, Job};
use crate::retry::BackoffPolicy;
use crate::worker::failure_update;

pub(crate) struct Reaper {
    backend: SharedBackend,
    backoff: Arc<dyn BackoffPolicy>,
    worker_id: String,
    interval: Duration,
    /// Age after which a claimed job that never started is stale.
    max_claimed: Duration,
    /// Fallback running ceiling for jobs without their own timeout.
    max_running: Duration,
    /// Terminal jobs older than this are purged.
    retention: Duration,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Reaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: SharedBackend,
        backoff: Arc<dyn BackoffPolicy>,
        worker_id: String,
        interval: Duration,
        max_claimed: Duration,
        max_running: Duration,
        retention: Duration,
        running: Arc<AtomicBool>,
        stop: Arc<Notify>,
    ) -> Self {
        Self {
            backend,
            backoff,
            worker_id,
            interval,
            max_claimed,
            max_running,
            retention,
            running,
            stop,
        }
    }

    pub async fn run(&self) {
        tracing::info!(interval = ?self.interval, "Reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does not
        // race freshly claimed jobs.
        ticker.tick().await;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.sweep().await;
        }

        tracing::info!("Reaper stopped");
    }

    /// One full pass: rescue stale jobs, then purge old terminal rows.
    pub(crate) async fn sweep(&self) {
        match self
            .backend
            .stale_jobs(self.max_claimed, self.max_running)
            .await
        {
            Ok(stale) => {
                if !stale.is_empty() {
                    tracing::warn!(count = stale.len(), "Rescuing stale jobs");
                }
                for job in stale {
                    self.rescue(job).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stale-job scan failed");
            }
        }

        let cutoff = now_ms() - self.retention.as_millis() as i64;
        match self.backend.delete_finished_jobs(cutoff).await {
            Ok(0) => {}
            Ok(purged) => {
                tracing::debug!(purged = purged, "Purged finished jobs");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Retention purge failed");
            }
        }
    }

    /// Treat one stale job as a failed attempt: retry with backoff if
    /// attempts remain, fail terminally otherwise. Errors on one job
    /// never abort the sweep.
    async fn rescue(&self, job: Job) {
        let error = ErrorData {
            name: "StaleJob".to_string(),
            message: format!(
                "job stranded in '{}' state by worker '{}'",
                job.state,
                job.claimed_by.as_deref().unwrap_or("unknown")
            ),
            stack: None,
            attempt: job.attempt + 1,
            attempted_at: now_ms(),
            attempt_by: self.worker_id.clone(),
        };
        let update = failure_update(&job, error, &*self.backoff);
        match self.backend.update_job(update).await {
            Ok(updated) => {
                tracing::warn!(
                    job_id = %job.id,
                    state = %updated.state,
                    attempt = updated.attempt,
                    "Rescued stale job"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to rescue stale job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::job::{JobState, JobUpdate, NewJob};
    use crate::memory::MemoryBackend;
    use crate::retry::ExponentialBackoff;

    fn reaper(backend: SharedBackend) -> Reaper {
        Reaper::new(
            backend,
            Arc::new(ExponentialBackoff::fixed(Duration::from_millis(1))),
            "reaper-test".to_string(),
            Duration::from_secs(30),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(3600),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn test_sweep_requeues_stale_claimed_job() {
        let backend = SharedBackend::new(MemoryBackend::new());
        let job = backend
            .create_job(NewJob::new("q", "c").max_attempts(3))
            .await
            .unwrap();
        backend.claim_pending("q", 1, "dead-worker").await.unwrap();

        reaper(backend.clone()).sweep().await;

        let rescued = backend.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(rescued.state, JobState::Waiting);
        assert_eq!(rescued.attempt, 1);
        assert!(rescued.claimed_by.is_none());
        assert_eq!(rescued.errors.len(), 1);
        assert_eq!(rescued.errors[0].name, "StaleJob");
    }

    #[tokio::test]
    async fn test_sweep_fails_stale_job_out_of_attempts() {
        let backend = SharedBackend::new(MemoryBackend::new());
        let job = backend
            .create_job(NewJob::new("q", "c").max_attempts(1))
            .await
            .unwrap();
        backend.claim_pending("q", 1, "dead-worker").await.unwrap();

        reaper(backend.clone()).sweep().await;

        let rescued = backend.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(rescued.state, JobState::Failed);
        assert!(rescued.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_purges_old_terminal_jobs() {
        let backend = SharedBackend::new(MemoryBackend::new());
        let job = backend.create_job(NewJob::new("q", "c")).await.unwrap();
        backend.claim_pending("q", 1, "w").await.unwrap();
        backend
            .update_job(JobUpdate::completed(job.id, serde_json::json!(null), 1))
            .await
            .unwrap();

        // Zero retention: everything terminal is past the cutoff.
        let reaper = Reaper::new(
            backend.clone(),
            Arc::new(ExponentialBackoff::fixed(Duration::from_millis(1))),
            "reaper-test".to_string(),
            Duration::from_secs(30),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::ZERO,
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
        );
        // Let the cutoff pass the completion timestamp.
        tokio::time::sleep(Duration::from_millis(5)).await;
        reaper.sweep().await;

        assert!(backend.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_jobs_alone() {
        let backend = SharedBackend::new(MemoryBackend::new());
        let job = backend.create_job(NewJob::new("q", "c")).await.unwrap();
        backend.claim_pending("q", 1, "w").await.unwrap();

        // Generous thresholds: nothing is stale yet.
        let reaper = Reaper::new(
            backend.clone(),
            Arc::new(ExponentialBackoff::fixed(Duration::from_millis(1))),
            "reaper-test".to_string(),
            Duration::from_secs(30),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
        );
        reaper.sweep().await;

        let unchanged = backend.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, JobState::Claimed);
        assert_eq!(unchanged.attempt, 0);
    }
}
