//! Engine orchestration: wiring the backend, registry, worker pools,
//! reaper, and scheduler into one lifecycle.

use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::backend::{Backend, NewQueue, SharedBackend, DEFAULT_CONCURRENCY};
use crate::config::EngineConfig;
use crate::error::{QuarryError, Result};
use crate::job::{now_ms, Job, JobId, JobState, JobUpdate, NewJob};
use crate::pool::{PoolState, QueuePool};
use crate::reaper::Reaper;
use crate::registry::JobRegistry;
use crate::scheduler::{RecurringScheduler, ScheduleId};
use crate::uniqueness;
use crate::worker::{CancelRegistry, Executor};

/// Generate a worker identity unique to this process.
fn generate_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}-{}", host, process::id(), now_ms())
}

/// Validate and insert one job, stamping its uniqueness digest.
///
/// Shared by direct enqueues and scheduler firings so both go through
/// identical validation and digest computation.
pub(crate) async fn enqueue_with(
    backend: &SharedBackend,
    registry: &JobRegistry,
    mut new: NewJob,
) -> Result<Job> {
    if new.queue.is_empty() {
        return Err(QuarryError::Validation(
            "job queue must not be empty".to_string(),
        ));
    }
    if new.class.is_empty() {
        return Err(QuarryError::Validation(
            "job class must not be empty".to_string(),
        ));
    }
    if new.max_attempts == 0 {
        return Err(QuarryError::Validation(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    if !registry.contains(&new.class) {
        return Err(QuarryError::Validation(format!(
            "unregistered job class: {}",
            new.class
        )));
    }

    new = uniqueness::stamp(new);
    let job = backend.create_job(new).await?;
    tracing::debug!(
        job_id = %job.id,
        queue = %job.queue,
        class = %job.class,
        "Job enqueued"
    );
    Ok(job)
}

/// The job engine: one instance per process.
///
/// Owns the job registry and cancellation registry, services the
/// configured queues with worker pools, runs the reaper and the
/// recurring scheduler, and drives graceful shutdown.
pub struct Engine {
    backend: SharedBackend,
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    scheduler: RecurringScheduler,
    cancels: Arc<CancelRegistry>,
    worker_id: String,
    running: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    stop: Arc<Notify>,
    pools: Mutex<Vec<Arc<PoolState>>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Engine {
    /// Create an engine over the given backend. Validates the
    /// configuration and runs pending schema migrations.
    pub async fn new<B: Backend + 'static>(backend: B, config: EngineConfig) -> Result<Self> {
        Self::with_shared(SharedBackend::new(backend), config).await
    }

    /// Create an engine over an already-shared backend.
    pub async fn with_shared(backend: SharedBackend, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        backend.migrate().await?;

        let registry = Arc::new(JobRegistry::new());
        let scheduler = RecurringScheduler::new(backend.clone(), registry.clone());
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(generate_worker_id);

        Ok(Self {
            backend,
            config,
            registry,
            scheduler,
            cancels: Arc::new(CancelRegistry::new()),
            worker_id,
            running: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            pools: Mutex::new(Vec::new()),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    /// The job registry; register classes before calling `start`.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// The storage backend this engine runs against.
    pub fn backend(&self) -> SharedBackend {
        self.backend.clone()
    }

    /// This engine's worker identity.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether the engine is started and not yet closed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start worker pools and the reaper.
    ///
    /// Persists the configured queues, discovers queues that already
    /// hold jobs, and starts one pool per queue in descending priority
    /// order. Idempotent per lifecycle: a second call on a running
    /// engine is rejected.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QuarryError::Config("engine already started".to_string()));
        }
        self.draining.store(false, Ordering::SeqCst);

        for spec in &self.config.queues {
            self.backend
                .insert_queue(
                    NewQueue::new(&spec.name)
                        .concurrency(spec.concurrency)
                        .priority(spec.priority),
                )
                .await?;
        }

        // Queues with job rows but no declaration still get serviced,
        // at default concurrency until someone configures them.
        let mut names: Vec<String> = self.config.queues.iter().map(|q| q.name.clone()).collect();
        for name in self.backend.queue_names().await? {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut prioritized: Vec<(i32, String)> = Vec::with_capacity(names.len());
        for name in names {
            let priority = self
                .backend
                .get_queue(&name)
                .await?
                .map(|q| q.priority)
                .unwrap_or(0);
            prioritized.push((priority, name));
        }
        prioritized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let executor = Arc::new(Executor::new(
            self.backend.clone(),
            self.registry.clone(),
            self.config.backoff.clone(),
            self.cancels.clone(),
            self.worker_id.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        let mut pools = self.pools.lock();
        for (_, name) in prioritized {
            let state = PoolState::new(name);
            pools.push(state.clone());
            let pool = QueuePool::new(
                self.backend.clone(),
                executor.clone(),
                state,
                self.worker_id.clone(),
                DEFAULT_CONCURRENCY as usize,
                self.config.batch_size,
                self.config.poll_interval,
                self.running.clone(),
                self.draining.clone(),
                self.stop.clone(),
            );
            tasks.spawn(async move { pool.run().await });
        }

        let reaper = Reaper::new(
            self.backend.clone(),
            self.config.backoff.clone(),
            self.worker_id.clone(),
            self.config.reaper_interval,
            self.config.max_claimed,
            self.config.max_running,
            self.config.retention,
            self.running.clone(),
            self.stop.clone(),
        );
        tasks.spawn(async move { reaper.run().await });

        tracing::info!(
            worker_id = %self.worker_id,
            queues = pools.len(),
            "Engine started"
        );
        Ok(())
    }

    /// Validate and persist one job.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        enqueue_with(&self.backend, &self.registry, new).await
    }

    /// Register a recurring schedule: `template` is invoked at each
    /// cron firing to build the job to enqueue.
    pub fn schedule<F>(&self, cron_expr: &str, template: F) -> Result<ScheduleId>
    where
        F: Fn() -> NewJob + Send + Sync + 'static,
    {
        self.scheduler.schedule(cron_expr, template)
    }

    /// Stop a recurring schedule. Returns whether it was known.
    pub fn unschedule(&self, id: ScheduleId) -> bool {
        self.scheduler.stop(id)
    }

    /// Cancel a job.
    ///
    /// Non-terminal jobs transition to `canceled` immediately; a job
    /// already running here is additionally flagged so cooperative
    /// handlers can bail out, and its eventual outcome write is
    /// absorbed by the terminal-state freeze. Canceling a terminal job
    /// is a no-op that returns the stored row.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let job = self.backend.update_job(JobUpdate::canceled(id)).await?;
        if self.cancels.request(id) {
            tracing::debug!(job_id = %id, "Cancellation requested for running job");
        }
        if job.state == JobState::Canceled {
            tracing::info!(job_id = %id, "Job canceled");
        }
        Ok(job)
    }

    /// Gracefully shut down: stop claiming, wait for in-flight jobs up
    /// to the shutdown timeout, stop schedules and background tasks,
    /// and release the backend.
    pub async fn close(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            // Never started (or already closed): there is nothing to
            // drain, but the backend connection still has to go.
            return self.backend.close().await;
        }
        tracing::info!("Engine shutting down");
        self.draining.store(true, Ordering::SeqCst);

        let pools: Vec<Arc<PoolState>> = self.pools.lock().drain(..).collect();
        let deadline = Instant::now() + self.config.shutdown_timeout;
        for state in &pools {
            while state.in_flight.load(Ordering::SeqCst) > 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!(
                        queue = %state.queue,
                        in_flight = state.in_flight.load(Ordering::SeqCst),
                        "Shutdown timeout reached with jobs still in flight"
                    );
                    break;
                }
                tokio::select! {
                    _ = state.drain_notify.notified() => {}
                    _ = tokio::time::sleep(remaining.min(std::time::Duration::from_millis(100))) => {}
                }
            }
        }

        self.scheduler.stop_all();
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.backend.close().await?;
        tracing::info!("Engine stopped");
        Ok(())
    }
}
