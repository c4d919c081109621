//! Error types for the quarry job engine.

use thiserror::Error;

use crate::job::JobId;

/// The main error type for the quarry library.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Malformed job or queue definition, or an invalid cron expression.
    /// Rejected synchronously at registration/enqueue time, never stored.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Enqueue rejected because an active job already holds the same
    /// uniqueness digest.
    #[error("Duplicate job: class '{class}' with digest '{digest}' is already active")]
    DuplicateJob {
        /// Job-type identifier of the conflicting job.
        class: String,
        /// The colliding uniqueness digest.
        digest: String,
    },

    /// Update or claim referenced a job id that does not exist.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific error (connection loss, constraint violation).
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;
