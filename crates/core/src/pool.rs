//! Per-queue worker pool.
//!
//! One pool services one queue: it keeps the number of concurrently
//! running jobs at or below the queue's configured concurrency, claims
//! eligible batches through the backend's claim protocol, and
//! dispatches each claimed job onto its own task. All cross-worker
//! coordination happens through the backend; pools in different
//! processes share nothing else.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::backend::{Backend, QueueState, SharedBackend};
use crate::error::Result;
use crate::worker::Executor;

/// Shared drain-accounting state for one pool, kept by the engine so
/// shutdown can wait on in-flight jobs.
pub(crate) struct PoolState {
    pub queue: String,
    pub in_flight: Arc<AtomicUsize>,
    pub drain_notify: Arc<Notify>,
}

impl PoolState {
    pub fn new(queue: String) -> Arc<Self> {
        Arc::new(Self {
            queue,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        })
    }
}

/// Claim-and-dispatch loop for a single queue.
pub(crate) struct QueuePool {
    backend: SharedBackend,
    executor: Arc<Executor>,
    state: Arc<PoolState>,
    worker_id: String,
    /// Used when the queue has no QueueConfig row.
    fallback_concurrency: usize,
    batch_size: usize,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl QueuePool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: SharedBackend,
        executor: Arc<Executor>,
        state: Arc<PoolState>,
        worker_id: String,
        fallback_concurrency: usize,
        batch_size: usize,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
        draining: Arc<AtomicBool>,
        stop: Arc<Notify>,
    ) -> Self {
        Self {
            backend,
            executor,
            state,
            worker_id,
            fallback_concurrency,
            batch_size,
            poll_interval,
            running,
            draining,
            stop,
        }
    }

    /// Run the claim loop until shutdown or drain.
    pub async fn run(&self) {
        tracing::info!(queue = %self.state.queue, "Worker pool started");

        while self.running.load(Ordering::SeqCst) {
            if self.draining.load(Ordering::SeqCst) {
                tracing::debug!(queue = %self.state.queue, "Pool draining, stopping claims");
                break;
            }

            match self.tick().await {
                // Claimed a batch: loop again immediately, there may
                // be more eligible work.
                Ok(true) => {}
                Ok(false) => self.idle_wait().await,
                Err(e) => {
                    // Transient backend errors are non-fatal for a
                    // pool: back off and retry.
                    tracing::warn!(
                        queue = %self.state.queue,
                        error = %e,
                        "Backend error during claim, retrying"
                    );
                    self.idle_wait().await;
                }
            }
        }

        tracing::info!(queue = %self.state.queue, "Worker pool stopped");
    }

    /// One iteration: read queue config, claim up to the available
    /// slots, dispatch. Returns whether anything was claimed.
    async fn tick(&self) -> Result<bool> {
        let (concurrency, paused) = match self.backend.get_queue(&self.state.queue).await? {
            Some(config) => (
                config.concurrency as usize,
                config.state == QueueState::Paused,
            ),
            None => (self.fallback_concurrency, false),
        };
        if paused {
            return Ok(false);
        }

        let available = concurrency.saturating_sub(self.state.in_flight.load(Ordering::SeqCst));
        if available == 0 {
            return Ok(false);
        }

        let quantity = available.min(self.batch_size);
        let jobs = self
            .backend
            .claim_pending(&self.state.queue, quantity, &self.worker_id)
            .await?;
        if jobs.is_empty() {
            return Ok(false);
        }

        tracing::debug!(
            queue = %self.state.queue,
            claimed = jobs.len(),
            "Claimed batch"
        );

        for job in jobs {
            self.state.in_flight.fetch_add(1, Ordering::SeqCst);
            let executor = self.executor.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                executor.execute(job).await;
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                state.drain_notify.notify_waiters();
            });
        }
        Ok(true)
    }

    async fn idle_wait(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.stop.notified() => {}
        }
    }
}
