//! Job class registry and the run contract.
//!
//! The engine locates a job's executable definition by its stored
//! class identifier through an explicitly-owned registry populated at
//! startup; there is no reflection or dynamic loading. A factory
//! receives the job's `constructor_args` and produces the runnable
//! instance; the run operation receives the job's `args` and reports
//! its outcome as a tagged result.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QuarryError, Result};
use crate::job::JobId;

/// Successful outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job finished; the value is recorded as its result.
    Complete(Value),
    /// The job asked to pause and run again after the given delay.
    /// Not a failure: consumes no attempt and records no error.
    Snooze(Duration),
}

/// Error raised by a job's run behavior. Recovered by the worker pool
/// and converted into an `ErrorData` entry, never propagated further.
#[derive(Debug, Clone)]
pub struct RunError {
    /// Error kind name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional trace text.
    pub stack: Option<String>,
}

impl RunError {
    /// Create a run error with an explicit kind name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach trace text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E: std::error::Error> From<E> for RunError {
    fn from(err: E) -> Self {
        Self::new("ExecutionError", err.to_string())
    }
}

/// Result type for job run behavior.
pub type RunResult = std::result::Result<Outcome, RunError>;

/// Execution context handed to a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being executed.
    pub job_id: JobId,
    /// Queue the job was claimed from.
    pub queue: String,
    /// Attempt number of this execution (0-based before increment).
    pub attempt: u32,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn new(job_id: JobId, queue: String, attempt: u32, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            job_id,
            queue,
            attempt,
            cancelled,
        }
    }

    /// Whether cancellation of this job has been requested.
    /// Cancellation of a running job is cooperative: long-running work
    /// should poll this and bail out when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A runnable job instance.
#[async_trait]
pub trait RunJob: Send + Sync {
    /// Execute one attempt with the job's run args.
    async fn run(&self, ctx: &JobContext, args: &[Value]) -> RunResult;
}

/// Factory producing a runnable instance from `constructor_args`.
pub type JobFactory = Arc<dyn Fn(&[Value]) -> Result<Box<dyn RunJob>> + Send + Sync>;

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> RunJob for FnJob<F>
where
    F: Fn(JobContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = RunResult> + Send,
{
    async fn run(&self, ctx: &JobContext, args: &[Value]) -> RunResult {
        (self.0)(ctx.clone(), args.to_vec()).await
    }
}

/// Registry mapping job-type identifiers to factories.
///
/// Owned by one Engine instance and passed by reference; supports
/// concurrent register/lookup/clear.
#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a job class. Replaces any previous
    /// registration for the same class.
    pub fn register<F>(&self, class: impl Into<String>, factory: F)
    where
        F: Fn(&[Value]) -> Result<Box<dyn RunJob>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(class.into(), Arc::new(factory));
    }

    /// Register an async handler for a job class that needs no
    /// constructor state.
    pub fn register_handler<F, Fut>(&self, class: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Vec<Value>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = RunResult> + Send + 'static,
    {
        self.register(class, move |_ctor: &[Value]| {
            Ok(Box::new(FnJob(handler.clone())) as Box<dyn RunJob>)
        });
    }

    /// Look up the factory for a class.
    pub fn lookup(&self, class: &str) -> Option<JobFactory> {
        self.factories.read().get(class).cloned()
    }

    /// Whether a class is registered.
    pub fn contains(&self, class: &str) -> bool {
        self.factories.read().contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove all registrations.
    pub fn clear(&self) {
        self.factories.write().clear();
    }

    /// Instantiate and validate a runnable for the class, surfacing a
    /// `Validation` error for unregistered classes.
    pub fn instantiate(&self, class: &str, constructor_args: &[Value]) -> Result<Box<dyn RunJob>> {
        let factory = self
            .lookup(class)
            .ok_or_else(|| QuarryError::Validation(format!("unregistered job class: {class}")))?;
        factory(constructor_args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_run_handler() {
        let registry = JobRegistry::new();
        registry.register_handler("echo", |_ctx, args| async move {
            Ok(Outcome::Complete(json!({ "echoed": args })))
        });

        assert!(registry.contains("echo"));
        let runnable = registry.instantiate("echo", &[]).unwrap();
        let ctx = JobContext::new(
            JobId(1),
            "q".to_string(),
            0,
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = runnable.run(&ctx, &[json!("hi")]).await.unwrap();
        assert_eq!(outcome, Outcome::Complete(json!({ "echoed": ["hi"] })));
    }

    #[tokio::test]
    async fn test_factory_receives_constructor_args() {
        struct Greeter {
            greeting: String,
        }

        #[async_trait]
        impl RunJob for Greeter {
            async fn run(&self, _ctx: &JobContext, args: &[Value]) -> RunResult {
                let name = args[0].as_str().unwrap_or("world");
                Ok(Outcome::Complete(json!(format!(
                    "{} {}",
                    self.greeting, name
                ))))
            }
        }

        let registry = JobRegistry::new();
        registry.register("greet", |ctor: &[Value]| {
            let greeting = ctor
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("hello")
                .to_string();
            Ok(Box::new(Greeter { greeting }) as Box<dyn RunJob>)
        });

        let runnable = registry.instantiate("greet", &[json!("hej")]).unwrap();
        let ctx = JobContext::new(
            JobId(2),
            "q".to_string(),
            0,
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = runnable.run(&ctx, &[json!("ana")]).await.unwrap();
        assert_eq!(outcome, Outcome::Complete(json!("hej ana")));
    }

    #[test]
    fn test_unregistered_class_is_validation_error() {
        let registry = JobRegistry::new();
        let err = match registry.instantiate("missing", &[]) {
            Err(e) => e,
            Ok(_) => panic!("expected instantiate to fail for unregistered class"),
        };
        assert!(matches!(err, QuarryError::Validation(_)));
    }

    #[test]
    fn test_clear_and_classes() {
        let registry = JobRegistry::new();
        registry.register_handler("b", |_ctx, _args| async { Ok(Outcome::Complete(json!(null))) });
        registry.register_handler("a", |_ctx, _args| async { Ok(Outcome::Complete(json!(null))) });
        assert_eq!(registry.classes(), vec!["a", "b"]);
        registry.clear();
        assert!(registry.classes().is_empty());
    }

    #[test]
    fn test_cancellation_flag_is_visible() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = JobContext::new(JobId(3), "q".to_string(), 0, flag.clone());
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }
}
