//! Background job engine.
//!
//! ```text
//! ┌──────────────┐   enqueue    ┌─────────────┐   claim_next   ┌──────────────┐
//! │  JobManager  │─────────────▶│ JobStorage  │◀───────────────│  WorkerPool  │
//! │  (facade)    │              │ (memory /   │  update_status │  (N workers  │
//! └──────┬───────┘              │  postgres)  │◀───────────────│   per queue) │
//!        │                      └──────▲──────┘                └──────┬───────┘
//!        │ add/enable/disable          │ due_schedules                │ dispatch
//!        ▼                             │ claim_firing                 ▼
//! ┌──────────────┐   enqueue           │                       ┌──────────────┐
//! │  Scheduler   │─────────────────────┘                       │ TaskRegistry │
//! │  (tick loop) │                                             │ name→handler │
//! └──────────────┘                                             └──────────────┘
//! ```
//!
//! Storage is the only place job status changes. Workers claim jobs
//! atomically, run the registered handler under the job's timeout, and
//! report the outcome as a conditional status update.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uno_jobs::jobs::{InMemoryStorage, JobManager, NewJob, Priority, TaskRegistry};
//!
//! # async fn run() -> uno_jobs::Result<()> {
//! let registry = TaskRegistry::new();
//! registry.register_fn("send_email", |_ctx| async move {
//!     Ok(serde_json::json!({"sent": true}))
//! });
//!
//! let manager = JobManager::new(Arc::new(InMemoryStorage::new()), registry);
//! manager.start()?;
//! let job = manager
//!     .enqueue(NewJob::new("send_email").priority(Priority::High))
//!     .await?;
//! println!("{}", manager.get_job(job.id).await?.status);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod job;
pub mod manager;
pub mod monitoring;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use builtin::register_builtins;
pub use job::{
    validate_queue_name, Job, JobFailure, JobId, JobStatus, NewJob, Priority, StatusUpdate,
    DEFAULT_QUEUE,
};
pub use manager::{JobManager, ManagerInfo};
pub use monitoring::{JobMetrics, MetricsSnapshot};
pub use queue::{Enqueuer, JobQueue, QueueInfo};
pub use registry::{TaskContext, TaskError, TaskHandler, TaskRegistry, TaskResult};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use schedule::{
    NewSchedule, Schedule, ScheduleDefinition, ScheduleFiring, ScheduleId, ScheduleUpdate,
};
pub use scheduler::{Scheduler, SchedulerStatus, TickReport};
pub use storage::{
    InMemoryStorage, JobFilter, JobStorage, PostgresStorage, StatusCounts, StorageRetry,
};
pub use worker::{CurrentJob, WorkerInfo, WorkerPool};
