#![allow(clippy::result_large_err)]
//! # Uno Jobs
//!
//! Background job engine: prioritized named queues, worker pools,
//! cron/interval/one-shot scheduling and an admin HTTP API.
//!
//! ## Architecture
//!
//! - **Storage**: the single arbiter of job status (in-memory or PostgreSQL),
//!   with atomic claims and conditional status updates
//! - **Queues**: named, pausable views over stored jobs, priority then FIFO
//! - **Worker Pool**: per-queue workers that claim, run and report jobs
//!   under per-job timeouts and a pluggable retry policy
//! - **Scheduler**: a tick loop turning due schedules into jobs through the
//!   same enqueue path as ad-hoc submissions
//! - **JobManager**: the facade the admin API is built on
//! - **Telemetry**: structured logging, Prometheus metrics and health checks

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, JobsError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, JobsError, Result};
    pub use crate::jobs::{
        InMemoryStorage, Job, JobId, JobManager, JobStatus, JobStorage, NewJob, NewSchedule,
        Priority, Schedule, ScheduleId, TaskContext, TaskError, TaskRegistry, TaskResult,
    };
}
