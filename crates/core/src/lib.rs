//! # quarry-core - Core types and traits for the quarry job engine
//!
//! This crate provides the core abstractions for the quarry background
//! job system:
//! - `Backend` trait for storage implementations, plus an in-memory
//!   reference backend
//! - `Job`, `JobId`, `JobState`, `NewJob`, `JobUpdate` lifecycle types
//! - `JobRegistry` and the `RunJob` contract for executable job classes
//! - `Engine` for enqueueing, worker pools, recurring schedules, stale
//!   recovery, and graceful shutdown

mod backend;
mod config;
mod engine;
mod error;
mod job;
mod memory;
mod pool;
mod reaper;
mod registry;
mod retry;
mod scheduler;
mod uniqueness;
mod worker;

// Re-export main types
pub use backend::{
    Backend, DynBackend, JobFilter, NewQueue, QueueConfig, QueueState, QueueUpdate, SharedBackend,
    StateCounts, TimeRange, DEFAULT_CONCURRENCY,
};
pub use config::{EngineConfig, QueueSpec};
pub use engine::Engine;
pub use error::{QuarryError, Result};
pub use job::{
    now_ms, ErrorData, Job, JobId, JobState, JobUpdate, NewJob, UniquenessConfig, UniquenessPolicy,
};
pub use memory::MemoryBackend;
pub use registry::{JobContext, JobFactory, JobRegistry, Outcome, RunError, RunJob, RunResult};
pub use retry::{BackoffPolicy, ExponentialBackoff};
pub use scheduler::{RecurringScheduler, ScheduleId};
pub use uniqueness::compute_digest;
pub use worker::CancelRegistry;
