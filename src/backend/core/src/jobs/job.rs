//! Job records and the status state machine.
//!
//! This module provides the data model shared by every other part of the
//! engine:
//!
//! - **JobId / Priority / JobStatus**: identifiers and closed enums, with an
//!   explicit name table for the wire form (`"HIGH"`, `"RUNNING"`, ...)
//! - **Job**: one unit of work with immutable identity and mutable state
//! - **NewJob**: a validated enqueue request
//! - **StatusUpdate**: the only way a stored job's status changes
//!
//! Legal status changes:
//!
//! ```text
//!   (create) ──▶ PENDING ──claim──▶ RUNNING ──▶ SUCCEEDED
//!                 │  ▲                │
//!          cancel │  └──retry later───┤
//!                 ▼                   ▼
//!             CANCELLED   PENDING ◀── FAILED
//!                         (retry_job)
//! ```
//!
//! `SCHEDULED` is never stored: it is how a PENDING job whose `scheduled_at`
//! lies in the future is reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{JobsError, Result};

/// Queue used when an enqueue request names none.
pub const DEFAULT_QUEUE: &str = "default";

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| JobsError::validation(format!("Invalid job id: {}", s)))
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs. Higher variants are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    /// Wire name of this priority.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Numeric rank used for ordering in storage backends.
    pub const fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.rank() == rank)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                JobsError::validation(format!(
                    "Invalid priority '{}': expected one of LOW, NORMAL, HIGH, CRITICAL",
                    s
                ))
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Pending, but `scheduled_at` is still in the future (reporting only)
    Scheduled,
    /// Claimed by a worker and executing
    Running,
    Succeeded,
    /// Retries exhausted; may be revived by an explicit retry
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Scheduled,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled)
    }

    /// The status actually written to storage for this one.
    pub fn stored(&self) -> Self {
        match self {
            Self::Scheduled => Self::Pending,
            other => *other,
        }
    }

    /// Check whether the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self.stored(), next.stored()),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Pending)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| {
                JobsError::validation(format!(
                    "Invalid status '{}': expected one of PENDING, SCHEDULED, RUNNING, SUCCEEDED, FAILED, CANCELLED",
                    s
                ))
            })
    }
}

/// Serialize closed enums through their wire names.
macro_rules! serde_by_name {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                name.parse().map_err(|e: JobsError| serde::de::Error::custom(e.message().to_string()))
            }
        }
    };
}

serde_by_name!(Priority);
serde_by_name!(JobStatus);

// ═══════════════════════════════════════════════════════════════════════════════
// Failure Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Failure kind, e.g. `TimeoutError`, `UnknownTaskError`, `TaskError`
    pub kind: String,
    /// Stack or other context supplied by the handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl From<&JobsError> for JobFailure {
    fn from(error: &JobsError) -> Self {
        Self::new(error.code().as_str(), error.message())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One unit of work.
///
/// Identity fields (`id`, `queue_name`, `task_name`, `args`, `kwargs`,
/// `priority`) never change after creation. Everything else is changed by
/// storage while applying a [`StatusUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub is_scheduled: bool,
    /// Worker that holds (or last held) the claim
    pub worker_id: Option<String>,
}

impl Job {
    /// Status as reported to callers: PENDING jobs with a future
    /// `scheduled_at` show as SCHEDULED.
    pub fn effective_status(&self, now: DateTime<Utc>) -> JobStatus {
        match (self.status, self.scheduled_at) {
            (JobStatus::Pending, Some(at)) if at > now => JobStatus::Scheduled,
            (status, _) => status,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Check whether this job matches a status filter entry.
    pub fn matches_status(&self, wanted: JobStatus, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == wanted
    }

    /// Wall time spent executing, if the job has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Whether a failed attempt may be re-queued.
    pub fn has_retries_left(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Mark this job as claimed by `worker_id`.
    pub(crate) fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.updated_at = now;
        self.worker_id = Some(worker_id.to_string());
    }

    /// Apply a status update, enforcing the state machine.
    ///
    /// On error the job is left untouched.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<()> {
        let to = update.to.stored();
        if !self.status.can_transition_to(to) {
            return Err(JobsError::invalid_transition(self.id, self.status, to));
        }
        if to == JobStatus::Running {
            // claims carry a worker id and only happen via claim_next
            return Err(JobsError::invalid_transition(self.id, self.status, to));
        }

        let from = self.status;
        self.status = to;
        self.updated_at = now;

        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(retries) = update.retries {
            self.retries = retries;
        }
        if let Some(scheduled_at) = update.scheduled_at {
            self.scheduled_at = scheduled_at;
        }

        match to {
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Pending if from == JobStatus::Failed => {
                self.completed_at = None;
                self.started_at = None;
                self.worker_id = None;
            }
            _ => {}
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Update
// ═══════════════════════════════════════════════════════════════════════════════

/// A requested status change plus the fields that travel with it.
///
/// Timestamps (`updated_at`, `completed_at`) are filled in by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub to: JobStatus,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub retries: Option<u32>,
    /// `Some(None)` clears `scheduled_at`; `None` leaves it alone
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
}

impl StatusUpdate {
    fn to(status: JobStatus) -> Self {
        Self {
            to: status,
            result: None,
            error: None,
            retries: None,
            scheduled_at: None,
        }
    }

    /// Handler returned successfully.
    pub fn succeeded(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::to(JobStatus::Succeeded)
        }
    }

    /// Handler failed and no retry follows.
    pub fn failed(error: JobFailure) -> Self {
        Self {
            error: Some(error),
            ..Self::to(JobStatus::Failed)
        }
    }

    /// Handler failed; put the job back with a delay.
    pub fn retry_at(retries: u32, at: DateTime<Utc>, error: JobFailure) -> Self {
        Self {
            error: Some(error),
            retries: Some(retries),
            scheduled_at: Some(Some(at)),
            ..Self::to(JobStatus::Pending)
        }
    }

    pub fn cancelled() -> Self {
        Self::to(JobStatus::Cancelled)
    }

    /// Execution was interrupted by the engine; run again now without
    /// spending a retry.
    pub fn released(error: JobFailure) -> Self {
        Self {
            error: Some(error),
            scheduled_at: Some(None),
            ..Self::to(JobStatus::Pending)
        }
    }

    /// Operator retry of a FAILED job: run again now with a fresh retry budget.
    pub fn requeued() -> Self {
        Self {
            retries: Some(0),
            scheduled_at: Some(None),
            ..Self::to(JobStatus::Pending)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enqueue Request
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_name: String,
    pub queue_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub is_scheduled: bool,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            queue_name: DEFAULT_QUEUE.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: Priority::Normal,
            scheduled_at: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            timeout: None,
            metadata: Map::new(),
            tags: BTreeSet::new(),
            is_scheduled: false,
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Reject malformed requests before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.task_name.trim().is_empty() {
            return Err(JobsError::validation("task_name cannot be empty"));
        }
        validate_queue_name(&self.queue_name)?;
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(JobsError::validation(format!(
                "max_retries cannot exceed {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(JobsError::validation("timeout must be greater than zero"));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(JobsError::validation("tags cannot be empty strings"));
        }
        Ok(())
    }

    /// Build the stored job record.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            queue_name: self.queue_name,
            task_name: self.task_name,
            args: self.args,
            kwargs: self.kwargs,
            priority: self.priority,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            scheduled_at: self.scheduled_at,
            started_at: None,
            completed_at: None,
            retries: 0,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            result: None,
            error: None,
            metadata: self.metadata,
            tags: self.tags,
            is_scheduled: self.is_scheduled,
            worker_id: None,
        }
    }
}

/// Queue names are short identifiers: letters, digits, `-`, `_`, `.`, `:`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(JobsError::validation(
            "queue_name must be between 1 and 128 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(JobsError::validation(format!(
            "queue_name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
