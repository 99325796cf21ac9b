//! Job storage: the single source of truth for job status.
//!
//! Every status change goes through [`JobStorage`]. Backends must make
//! `claim_next`, `update_status` and the schedule firing operations atomic
//! so that concurrent workers, cancel requests and scheduler instances never
//! lose an update.

mod memory;
mod postgres;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use super::job::{Job, JobId, JobStatus, StatusUpdate};
use super::schedule::{ScheduleDefinition, ScheduleFiring, ScheduleId};
use crate::error::Result;

/// Default page size for job listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Largest page a single listing may return.
pub const MAX_LIST_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Filters and Counts
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter for job listings. Results are ordered by `created_at`, then insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    /// Reported statuses to include; empty means all
    pub statuses: Vec<JobStatus>,
    pub queue_name: Option<String>,
    pub tag: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            queue_name: None,
            tag: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Effective page size, clamped to `MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_LIST_LIMIT)
    }

    pub fn matches(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if let Some(queue) = &self.queue_name {
            if &job.queue_name != queue {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !job.tags.contains(tag) {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.iter().any(|s| job.matches_status(*s, now))
    }
}

/// Job counts per reported status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StatusCounts {
    pub pending: u64,
    pub scheduled: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Scheduled => self.scheduled,
            JobStatus::Running => self.running,
            JobStatus::Succeeded => self.succeeded,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Scheduled => &mut self.scheduled,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Jobs waiting in the queue, whether eligible now or later.
    pub fn waiting(&self) -> u64 {
        self.pending + self.scheduled
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Backing store for jobs, queue state and schedule definitions.
#[async_trait]
pub trait JobStorage: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Check the backend is reachable.
    async fn ping(&self) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new job. Fails with `DuplicateId` if the id exists.
    async fn persist(&self, job: &Job) -> Result<JobId>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically move a job to `update.to` and return the stored result.
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidTransition` when the
    /// state machine forbids the change; the stored job is then untouched.
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job>;

    /// List jobs matching `filter`. Reads have no side effects.
    async fn get_jobs_by_status(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Claim the highest-priority eligible job of `queue_name` for `worker_id`.
    ///
    /// At most one caller ever receives a given job.
    async fn claim_next(&self, queue_name: &str, worker_id: &str) -> Result<Option<Job>>;

    /// Cancel every PENDING job of a queue and return how many were cancelled.
    async fn clear_queue(&self, queue_name: &str) -> Result<u64>;

    /// Counts per reported status, for one queue or all of them.
    async fn count_by_status(&self, queue_name: Option<&str>) -> Result<StatusCounts>;

    // ─────────────────────────────────────────────────────────────────────────
    // Queues
    // ─────────────────────────────────────────────────────────────────────────

    /// Names of every queue that holds jobs or has stored state.
    async fn queue_names(&self) -> Result<Vec<String>>;

    async fn set_queue_paused(&self, queue_name: &str, paused: bool) -> Result<()>;

    async fn paused_queues(&self) -> Result<HashSet<String>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Schedules
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>>;

    /// All schedules ordered by creation time.
    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>>;

    /// Write the definition fields of a schedule, plus `enabled` and
    /// `next_run_at`, if its stored `run_count` still equals
    /// `schedule.run_count`. Returns false when a firing got there first.
    /// Firing bookkeeping (`last_run_at`, `run_count`) is only changed by
    /// the firing operations. Fails with `NotFound`.
    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<bool>;

    /// Delete a schedule; returns whether it existed.
    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool>;

    /// Enabled schedules with `next_run_at <= now`, earliest first.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>>;

    /// Take the firing slot: applies `firing` only if the schedule is still
    /// enabled and its `run_count` is unchanged. Returns whether it applied.
    async fn claim_firing(&self, firing: &ScheduleFiring) -> Result<bool>;

    /// Undo a claimed firing whose job could not be enqueued.
    async fn revert_firing(&self, firing: &ScheduleFiring) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bounded Retry
// ═══════════════════════════════════════════════════════════════════════════════

/// How callers retry retryable storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl StorageRetry {
    /// Run `op`, retrying retryable errors up to `attempts` times in total.
    ///
    /// The backoff doubles after each failed attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobsError;
    use crate::jobs::job::NewJob;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let job = NewJob::new("t").queue("emails").tag("urgent").into_job(now);

        assert!(JobFilter::default().matches(&job, now));
        assert!(JobFilter::default().queue("emails").matches(&job, now));
        assert!(!JobFilter::default().queue("reports").matches(&job, now));
        assert!(JobFilter::default().tag("urgent").matches(&job, now));
        assert!(!JobFilter::default().tag("later").matches(&job, now));
        assert!(JobFilter::default().status(JobStatus::Pending).matches(&job, now));
        assert!(!JobFilter::default().status(JobStatus::Scheduled).matches(&job, now));
    }

    #[test]
    fn test_effective_limit_is_clamped() {
        assert_eq!(JobFilter::default().effective_limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(JobFilter::default().page(5000, 0).effective_limit(), MAX_LIST_LIMIT);
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Pending, 2);
        counts.add(JobStatus::Scheduled, 1);
        counts.add(JobStatus::Failed, 4);
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.waiting(), 3);

        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["FAILED"], 4);
    }

    #[tokio::test]
    async fn test_storage_retry_gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = StorageRetry {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let result: Result<()> = retry
            .run("ping", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobsError::storage("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_storage_retry_does_not_retry_validation() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = StorageRetry::default()
            .run("persist", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobsError::validation("bad"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_storage_retry_recovers() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = StorageRetry {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let value = retry
            .run("get", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(JobsError::storage("blip"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
