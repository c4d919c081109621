//! Recurring-job scheduler.
//!
//! Maps cron expressions to enqueue actions. Registration validates
//! the expression and begins firing; each firing is a normal engine
//! enqueue. The registry is owned by one Engine instance: schedules
//! can be stopped individually or all together, and stopping always
//! removes the entry even when the underlying stop signal errors.

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::SharedBackend;
use crate::engine::enqueue_with;
use crate::error::{QuarryError, Result};
use crate::job::NewJob;
use crate::registry::JobRegistry;

/// Unique identifier for a registered schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(pub Uuid);

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Factory producing the job definition for each firing.
pub type JobTemplate = Arc<dyn Fn() -> NewJob + Send + Sync>;

struct ScheduleEntry {
    expr: String,
    stop: oneshot::Sender<()>,
}

/// Registry of active cron schedules for one engine.
pub struct RecurringScheduler {
    backend: SharedBackend,
    registry: Arc<JobRegistry>,
    entries: Mutex<HashMap<ScheduleId, ScheduleEntry>>,
}

impl RecurringScheduler {
    pub(crate) fn new(backend: SharedBackend, registry: Arc<JobRegistry>) -> Self {
        Self {
            backend,
            registry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a cron schedule and begin firing.
    ///
    /// Fails fast with a `Validation` error on a malformed expression.
    /// The template is invoked once per firing to build the job.
    pub fn schedule<F>(&self, cron_expr: &str, template: F) -> Result<ScheduleId>
    where
        F: Fn() -> NewJob + Send + Sync + 'static,
    {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| {
            QuarryError::Validation(format!("invalid cron expression '{cron_expr}': {e}"))
        })?;

        let id = ScheduleId(Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            id,
            ScheduleEntry {
                expr: cron_expr.to_string(),
                stop: tx,
            },
        );

        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let template: JobTemplate = Arc::new(template);
        tokio::spawn(fire_loop(id, schedule, backend, registry, template, rx));

        tracing::info!(schedule_id = %id, cron = %cron_expr, "Schedule registered");
        Ok(id)
    }

    /// Stop one schedule. Best-effort: the entry is removed from the
    /// registry even when the stop signal can no longer be delivered.
    /// Returns whether the schedule was known.
    pub fn stop(&self, id: ScheduleId) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                if entry.stop.send(()).is_err() {
                    tracing::warn!(
                        schedule_id = %id,
                        cron = %entry.expr,
                        "Schedule task already stopped"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Stop all schedules. A failure to stop one never prevents
    /// stopping the others; the registry is always left empty.
    pub fn stop_all(&self) {
        let entries: Vec<(ScheduleId, ScheduleEntry)> =
            self.entries.lock().drain().collect();
        for (id, entry) in entries {
            if entry.stop.send(()).is_err() {
                tracing::warn!(schedule_id = %id, "Schedule task already stopped");
            }
        }
    }

    /// Ids of currently registered schedules.
    pub fn schedule_ids(&self) -> Vec<ScheduleId> {
        self.entries.lock().keys().copied().collect()
    }

    /// Number of active schedules.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no schedules are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

async fn fire_loop(
    id: ScheduleId,
    schedule: Schedule,
    backend: SharedBackend,
    registry: Arc<JobRegistry>,
    template: JobTemplate,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::debug!(schedule_id = %id, "Schedule exhausted");
            break;
        };
        let delay = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let new = template();
                match enqueue_with(&backend, &registry, new).await {
                    Ok(job) => {
                        tracing::debug!(schedule_id = %id, job_id = %job.id, "Schedule fired");
                    }
                    Err(QuarryError::DuplicateJob { class, .. }) => {
                        tracing::debug!(
                            schedule_id = %id,
                            class = %class,
                            "Schedule firing skipped, job already active"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(schedule_id = %id, error = %e, "Schedule firing failed");
                    }
                }
            }
            _ = &mut stop => break,
        }
    }

    tracing::debug!(schedule_id = %id, "Schedule stopped");
}
