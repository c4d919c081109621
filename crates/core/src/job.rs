//! Job definition, lifecycle states, and update payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Unique identifier for a job. Assigned by the backend, monotonic per
/// backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a job.
///
/// Legal transitions: `Waiting → Claimed → Running → {Completed |
/// Failed | Canceled}`. A `Claimed` or `Running` job may move back to
/// `Waiting` (retry or snooze) only while attempts remain. `Completed`,
/// `Failed`, and `Canceled` are terminal: once entered, the state never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible to be claimed once `available_at` has passed.
    Waiting,
    /// Handed to a worker by the claim protocol, not yet executing.
    Claimed,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted all attempts.
    Failed,
    /// Canceled by an external request.
    Canceled,
}

impl JobState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Stable string form, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error record per failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Error kind name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional trace text.
    pub stack: Option<String>,
    /// Which attempt produced this error (1-based).
    pub attempt: u32,
    /// When the failing attempt started (Unix epoch milliseconds).
    pub attempted_at: i64,
    /// Identity of the worker that ran the failing attempt.
    pub attempt_by: String,
}

/// Uniqueness policy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UniquenessPolicy {
    /// The digest blocks duplicates while any job holding it is
    /// non-terminal.
    #[default]
    Alive,
}

/// Uniqueness configuration attached to a job at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UniquenessConfig {
    /// Policy governing when the digest blocks duplicates.
    #[serde(default)]
    pub policy: UniquenessPolicy,
    /// Explicit caller-supplied key. When absent the digest is derived
    /// from the job class and normalized args.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl UniquenessConfig {
    /// Uniqueness derived from the job class and args.
    pub fn by_args() -> Self {
        Self::default()
    }

    /// Uniqueness derived from an explicit key.
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            policy: UniquenessPolicy::Alive,
            key: Some(key.into()),
        }
    }
}

/// A unit of enqueued work with its own lifecycle state.
///
/// All timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Backend-assigned identifier.
    pub id: JobId,
    /// Named partition this job belongs to.
    pub queue: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Job-type identifier, resolved via the job registry.
    pub class: String,
    /// Ordered arguments passed to the run operation.
    pub args: Vec<Value>,
    /// Ordered arguments used to instantiate the job before running.
    pub constructor_args: Vec<Value>,
    /// Retries consumed so far.
    pub attempt: u32,
    /// Maximum attempts before the job fails terminally (>= 1).
    pub max_attempts: u32,
    /// Optional bound on a single running attempt.
    #[serde(with = "duration_serde", default)]
    pub timeout: Option<Duration>,
    /// Result value, set on success.
    pub result: Option<Value>,
    /// One entry per failed attempt.
    pub errors: Vec<ErrorData>,
    /// When the job row was created.
    pub inserted_at: i64,
    /// Earliest time the job is eligible to be claimed.
    pub available_at: i64,
    /// When the current/last attempt started.
    pub attempted_at: Option<i64>,
    /// Set on transition to `Completed`.
    pub completed_at: Option<i64>,
    /// Set on transition to `Failed`.
    pub failed_at: Option<i64>,
    /// Set on transition to `Canceled`.
    pub cancelled_at: Option<i64>,
    /// Identity of the worker currently holding the job.
    pub claimed_by: Option<String>,
    /// When the job was claimed.
    pub claimed_at: Option<i64>,
    /// Digest preventing duplicate active jobs, when uniqueness is
    /// configured. Cleared on terminal transition.
    pub unique_digest: Option<String>,
    /// Uniqueness policy descriptor, when configured.
    pub uniqueness: Option<UniquenessConfig>,
}

impl Job {
    /// The terminal timestamp, if the job has reached a terminal state.
    pub fn finished_at(&self) -> Option<i64> {
        self.completed_at.or(self.failed_at).or(self.cancelled_at)
    }
}

/// Insert payload for a new job. Defaults are applied by the backend:
/// `attempt = 0`, `state = waiting` unless specified, `available_at =
/// now` if absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Target queue name.
    pub queue: String,
    /// Job-type identifier.
    pub class: String,
    /// Arguments for the run operation.
    pub args: Vec<Value>,
    /// Arguments for job instantiation.
    pub constructor_args: Vec<Value>,
    /// Maximum attempts (>= 1).
    pub max_attempts: u32,
    /// Optional bound on a single running attempt.
    #[serde(with = "duration_serde", default)]
    pub timeout: Option<Duration>,
    /// Earliest claim eligibility; defaults to now.
    pub available_at: Option<i64>,
    /// Initial state; defaults to `Waiting`.
    pub state: Option<JobState>,
    /// Uniqueness policy. The digest itself is computed by the engine
    /// before insert.
    pub uniqueness: Option<UniquenessConfig>,
    /// Pre-computed uniqueness digest.
    pub unique_digest: Option<String>,
}

impl NewJob {
    /// Create a new job definition for the given queue and class.
    pub fn new(queue: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            class: class.into(),
            args: Vec::new(),
            constructor_args: Vec::new(),
            max_attempts: 3,
            timeout: None,
            available_at: None,
            state: None,
            uniqueness: None,
            unique_digest: None,
        }
    }

    /// Append a run argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the run arguments.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Append a constructor argument.
    pub fn constructor_arg(mut self, value: impl Into<Value>) -> Self {
        self.constructor_args.push(value.into());
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay eligibility until the given epoch-millisecond timestamp.
    pub fn available_at(mut self, at: i64) -> Self {
        self.available_at = Some(at);
        self
    }

    /// Delay eligibility by the given duration from now.
    pub fn available_in(self, delay: Duration) -> Self {
        let at = now_ms() + delay.as_millis() as i64;
        self.available_at(at)
    }

    /// Attach a uniqueness policy.
    pub fn unique(mut self, config: UniquenessConfig) -> Self {
        self.uniqueness = Some(config);
        self
    }
}

/// Partial update applied atomically to a single job row.
///
/// Constructed through the transition-specific constructors so state
/// side effects stay consistent; backends apply it with
/// [`JobUpdate::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Target job id.
    pub id: JobId,
    /// New state.
    pub state: Option<JobState>,
    /// New attempt count.
    pub attempt: Option<u32>,
    /// Result value to record.
    pub result: Option<Value>,
    /// Error record to append.
    pub error: Option<ErrorData>,
    /// New claim-eligibility timestamp.
    pub available_at: Option<i64>,
    /// Attempt-start timestamp.
    pub attempted_at: Option<i64>,
    /// Terminal timestamps; at most one is set.
    pub completed_at: Option<i64>,
    /// See `completed_at`.
    pub failed_at: Option<i64>,
    /// See `completed_at`.
    pub cancelled_at: Option<i64>,
}

impl JobUpdate {
    fn base(id: JobId) -> Self {
        Self {
            id,
            state: None,
            attempt: None,
            result: None,
            error: None,
            available_at: None,
            attempted_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    /// Transition to `Running` at the start of an attempt.
    pub fn running(id: JobId) -> Self {
        Self {
            state: Some(JobState::Running),
            attempted_at: Some(now_ms()),
            ..Self::base(id)
        }
    }

    /// Transition to `Completed` with a result value, recording the
    /// attempt that produced it.
    pub fn completed(id: JobId, result: Value, attempt: u32) -> Self {
        Self {
            id,
            state: Some(JobState::Completed),
            attempt: Some(attempt),
            result: Some(result),
            completed_at: Some(now_ms()),
            ..Self::base(id)
        }
    }

    /// Record a failed attempt and requeue for retry.
    pub fn retry(id: JobId, error: ErrorData, attempt: u32, available_at: i64) -> Self {
        Self {
            id,
            state: Some(JobState::Waiting),
            attempt: Some(attempt),
            error: Some(error),
            available_at: Some(available_at),
            ..Self::base(id)
        }
    }

    /// Record the final failed attempt and terminate.
    pub fn failed(id: JobId, error: ErrorData, attempt: u32) -> Self {
        Self {
            id,
            state: Some(JobState::Failed),
            attempt: Some(attempt),
            error: Some(error),
            failed_at: Some(now_ms()),
            ..Self::base(id)
        }
    }

    /// Reschedule a snoozed job. Does not touch `attempt` or `errors`:
    /// snooze is a control signal, not a failure.
    pub fn snoozed(id: JobId, available_at: i64) -> Self {
        Self {
            id,
            state: Some(JobState::Waiting),
            available_at: Some(available_at),
            ..Self::base(id)
        }
    }

    /// Transition to `Canceled`.
    pub fn canceled(id: JobId) -> Self {
        Self {
            id,
            state: Some(JobState::Canceled),
            cancelled_at: Some(now_ms()),
            ..Self::base(id)
        }
    }

    /// Apply this update to a job row, enforcing the state-machine
    /// invariants shared by all backends:
    ///
    /// - a terminal job is frozen: the update is a no-op;
    /// - leaving `Claimed`/`Running` clears the claim stamp;
    /// - entering a terminal state clears `unique_digest`, releasing
    ///   the active-uniqueness window.
    ///
    /// Returns `false` when the update was ignored because the job was
    /// already terminal.
    pub fn apply(&self, job: &mut Job) -> bool {
        if job.state.is_terminal() {
            return false;
        }

        if let Some(state) = self.state {
            job.state = state;
        }
        if let Some(attempt) = self.attempt {
            job.attempt = attempt;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            job.errors.push(error.clone());
        }
        if let Some(at) = self.available_at {
            job.available_at = at;
        }
        if let Some(at) = self.attempted_at {
            job.attempted_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            job.failed_at = Some(at);
        }
        if let Some(at) = self.cancelled_at {
            job.cancelled_at = Some(at);
        }

        if !matches!(job.state, JobState::Claimed | JobState::Running) {
            job.claimed_by = None;
            job.claimed_at = None;
        }
        if job.state.is_terminal() {
            job.unique_digest = None;
        }

        true
    }
}

/// Get the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Serde module for optional Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
