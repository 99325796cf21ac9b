//! Schedule definitions: cron, interval and one-shot rules that produce jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::job::{validate_queue_name, NewJob, Priority, DEFAULT_QUEUE, MAX_RETRIES_LIMIT};
use crate::error::{JobsError, Result};

/// Unique identifier for a schedule definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScheduleId {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| JobsError::validation(format!("Invalid schedule id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Value
// ═══════════════════════════════════════════════════════════════════════════════

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Schedule {
    /// Cron expression, 5 fields (minute precision) or 6/7 fields (with seconds, year)
    Cron { expression: String },
    /// Fixed period measured from the previous firing
    Interval {
        #[serde(with = "humantime_serde")]
        period: Duration,
    },
    /// Fire once at `at`, then disable
    OneShot { at: DateTime<Utc> },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn interval(period: Duration) -> Self {
        Self::Interval { period }
    }

    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self::OneShot { at }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "CRON",
            Self::Interval { .. } => "INTERVAL",
            Self::OneShot { .. } => "ONE_SHOT",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
            Self::Interval { period } if period.is_zero() => {
                Err(JobsError::validation("interval period must be greater than zero"))
            }
            _ => Ok(()),
        }
    }

    /// First due time for a freshly created or re-enabled schedule.
    pub fn first_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::OneShot { at } => Ok(Some(*at)),
            _ => self.next_after(now),
        }
    }

    /// Next due time after a firing at `fired_at`. `None` means never again.
    pub fn next_after(&self, fired_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Cron { expression } => Ok(parse_cron(expression)?.after(&fired_at).next()),
            Self::Interval { period } => {
                let period = chrono::Duration::from_std(*period)
                    .map_err(|_| JobsError::validation("interval period is too large"))?;
                Ok(fired_at.checked_add_signed(period))
            }
            Self::OneShot { .. } => Ok(None),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression } => write!(f, "cron({})", expression),
            Self::Interval { period } => {
                write!(f, "every {}", humantime_serde::re::humantime::format_duration(*period))
            }
            Self::OneShot { at } => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

/// Parse a cron expression. Five-field expressions get a zero seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        _ => {
            return Err(JobsError::validation(format!(
                "Invalid cron expression '{}': expected 5, 6 or 7 fields",
                expression
            )))
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        JobsError::validation(format!("Invalid cron expression '{}': {}", expression, e))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored rule that produces jobs over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: ScheduleId,
    pub name: String,
    pub task_name: String,
    pub queue_name: String,
    pub priority: Priority,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub schedule: Schedule,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Number of firings; doubles as the version for conditional advances
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// The job one firing of this schedule enqueues.
    pub fn to_new_job(&self) -> NewJob {
        let mut job = NewJob::new(&self.task_name)
            .queue(&self.queue_name)
            .priority(self.priority)
            .args(self.args.clone())
            .max_retries(self.max_retries)
            .retry_delay(self.retry_delay)
            .meta("schedule_id", Value::String(self.id.to_string()))
            .meta("schedule_name", Value::String(self.name.clone()));
        job.kwargs = self.kwargs.clone();
        job.timeout = self.timeout;
        job.tags = self.tags.clone();
        for (key, value) in &self.metadata {
            job.metadata.insert(key.clone(), value.clone());
        }
        job.is_scheduled = true;
        job
    }

    /// Compute the state change for firing at `now`.
    pub fn firing(&self, now: DateTime<Utc>) -> Result<ScheduleFiring> {
        let next_run_at = self.schedule.next_after(now)?;
        Ok(ScheduleFiring {
            schedule_id: self.id,
            run_count: self.run_count,
            previous_last_run_at: self.last_run_at,
            previous_next_run_at: self.next_run_at,
            fired_at: now,
            next_run_at,
            disable: matches!(self.schedule, Schedule::OneShot { .. }) || next_run_at.is_none(),
        })
    }

    pub(crate) fn enable(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.next_run_at = self.schedule.first_run(now)?;
        self.enabled = true;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn disable(&mut self, now: DateTime<Utc>) {
        self.enabled = false;
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Apply a partial update. The due time is recomputed when the rule changes.
    pub(crate) fn apply(&mut self, update: ScheduleUpdate, now: DateTime<Utc>) -> Result<()> {
        let mut candidate = self.clone();
        let schedule_changed = update.schedule.is_some();
        let enabled = update.enabled.unwrap_or(self.enabled);

        if let Some(name) = update.name {
            candidate.name = name;
        }
        if let Some(task_name) = update.task_name {
            candidate.task_name = task_name;
        }
        if let Some(queue_name) = update.queue_name {
            candidate.queue_name = queue_name;
        }
        if let Some(priority) = update.priority {
            candidate.priority = priority;
        }
        if let Some(args) = update.args {
            candidate.args = args;
        }
        if let Some(kwargs) = update.kwargs {
            candidate.kwargs = kwargs;
        }
        if let Some(max_retries) = update.max_retries {
            candidate.max_retries = max_retries;
        }
        if let Some(retry_delay) = update.retry_delay {
            candidate.retry_delay = retry_delay;
        }
        if let Some(timeout) = update.timeout {
            candidate.timeout = timeout;
        }
        if let Some(metadata) = update.metadata {
            candidate.metadata = metadata;
        }
        if let Some(tags) = update.tags {
            candidate.tags = tags;
        }
        if let Some(schedule) = update.schedule {
            candidate.schedule = schedule;
        }
        candidate.validate()?;

        if !enabled {
            if self.enabled {
                candidate.disable(now);
            }
        } else if schedule_changed || !self.enabled {
            candidate.enable(now)?;
        }
        candidate.updated_at = now;
        *self = candidate;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_definition_fields(
            &self.name,
            &self.task_name,
            &self.queue_name,
            self.max_retries,
            self.timeout,
        )?;
        self.schedule.validate()
    }
}

fn validate_definition_fields(
    name: &str,
    task_name: &str,
    queue_name: &str,
    max_retries: u32,
    timeout: Option<Duration>,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(JobsError::validation("schedule name cannot be empty"));
    }
    if task_name.trim().is_empty() {
        return Err(JobsError::validation("task_name cannot be empty"));
    }
    validate_queue_name(queue_name)?;
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(JobsError::validation(format!(
            "max_retries cannot exceed {}",
            MAX_RETRIES_LIMIT
        )));
    }
    if timeout == Some(Duration::ZERO) {
        return Err(JobsError::validation("timeout must be greater than zero"));
    }
    Ok(())
}

/// The state change of one firing, used both to claim the slot and to give
/// it back when enqueueing fails.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleFiring {
    pub schedule_id: ScheduleId,
    /// `run_count` observed before firing
    pub run_count: u64,
    pub previous_last_run_at: Option<DateTime<Utc>>,
    pub previous_next_run_at: Option<DateTime<Utc>>,
    pub fired_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// One-shot schedules disable themselves after firing
    pub disable: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to create a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub name: String,
    pub task_name: String,
    pub schedule: Schedule,
    pub queue_name: String,
    pub priority: Priority,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub enabled: bool,
}

impl NewSchedule {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            schedule,
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: Priority::Normal,
            args: Vec::new(),
            kwargs: Map::new(),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            timeout: None,
            metadata: Map::new(),
            tags: BTreeSet::new(),
            enabled: true,
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

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_definition_fields(
            &self.name,
            &self.task_name,
            &self.queue_name,
            self.max_retries,
            self.timeout,
        )?;
        self.schedule.validate()
    }

    pub fn into_definition(self, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let next_run_at = if self.enabled {
            self.schedule.first_run(now)?
        } else {
            None
        };
        Ok(ScheduleDefinition {
            id: ScheduleId::new(),
            name: self.name,
            task_name: self.task_name,
            queue_name: self.queue_name,
            priority: self.priority,
            args: self.args,
            kwargs: self.kwargs,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            metadata: self.metadata,
            tags: self.tags,
            schedule: self.schedule,
            enabled: self.enabled,
            next_run_at,
            last_run_at: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of a schedule. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub task_name: Option<String>,
    pub queue_name: Option<String>,
    pub priority: Option<Priority>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// `Some(None)` clears the timeout
    pub timeout: Option<Option<Duration>>,
    pub metadata: Option<Map<String, Value>>,
    pub tags: Option<BTreeSet<String>>,
    pub schedule: Option<Schedule>,
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        let schedule = Schedule::cron("*/5 * * * *");
        schedule.validate().unwrap();
        assert_eq!(schedule.next_after(at(10, 2, 30)).unwrap(), Some(at(10, 5, 0)));
    }

    #[test]
    fn test_six_field_cron() {
        let schedule = Schedule::cron("30 * * * * *");
        assert_eq!(schedule.next_after(at(10, 2, 30)).unwrap(), Some(at(10, 3, 30)));
    }

    #[test]
    fn test_invalid_cron_is_validation_error() {
        let err = Schedule::cron("not a cron").validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
        assert!(Schedule::cron("* * *").validate().is_err());
    }

    #[test]
    fn test_interval_next_after() {
        let schedule = Schedule::interval(Duration::from_secs(90));
        assert_eq!(schedule.next_after(at(10, 0, 0)).unwrap(), Some(at(10, 1, 30)));
        assert!(Schedule::interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let schedule = Schedule::one_shot(at(12, 0, 0));
        assert_eq!(schedule.first_run(at(9, 0, 0)).unwrap(), Some(at(12, 0, 0)));
        assert_eq!(schedule.next_after(at(12, 0, 0)).unwrap(), None);

        let def = NewSchedule::new("once", "noop", schedule)
            .into_definition(at(9, 0, 0))
            .unwrap();
        let firing = def.firing(at(12, 0, 1)).unwrap();
        assert!(firing.disable);
        assert_eq!(firing.next_run_at, None);
    }

    #[test]
    fn test_definition_due_and_job() {
        let def = NewSchedule::new("nightly", "report", Schedule::interval(Duration::from_secs(60)))
            .queue("reports")
            .priority(Priority::High)
            .into_definition(at(10, 0, 0))
            .unwrap();
        assert_eq!(def.next_run_at, Some(at(10, 1, 0)));
        assert!(!def.is_due(at(10, 0, 30)));
        assert!(def.is_due(at(10, 1, 0)));

        let job = def.to_new_job();
        assert!(job.is_scheduled);
        assert_eq!(job.queue_name, "reports");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.metadata["schedule_id"], Value::String(def.id.to_string()));
    }

    #[test]
    fn test_disabled_definition_is_never_due() {
        let def = NewSchedule::new("off", "noop", Schedule::interval(Duration::from_secs(1)))
            .disabled()
            .into_definition(at(10, 0, 0))
            .unwrap();
        assert_eq!(def.next_run_at, None);
        assert!(!def.is_due(at(23, 0, 0)));
    }

    #[test]
    fn test_update_recomputes_next_run() {
        let mut def = NewSchedule::new("s", "noop", Schedule::interval(Duration::from_secs(60)))
            .into_definition(at(10, 0, 0))
            .unwrap();
        let update = ScheduleUpdate {
            schedule: Some(Schedule::interval(Duration::from_secs(600))),
            ..Default::default()
        };
        def.apply(update, at(10, 0, 30)).unwrap();
        assert_eq!(def.next_run_at, Some(at(10, 10, 30)));
    }

    #[test]
    fn test_invalid_update_leaves_definition_untouched() {
        let mut def = NewSchedule::new("s", "noop", Schedule::interval(Duration::from_secs(60)))
            .into_definition(at(10, 0, 0))
            .unwrap();
        let before = def.clone();
        let update = ScheduleUpdate {
            name: Some("renamed".into()),
            schedule: Some(Schedule::cron("bogus")),
            ..Default::default()
        };
        assert!(def.apply(update, at(10, 0, 30)).is_err());
        assert_eq!(def, before);
    }

    #[test]
    fn test_schedule_wire_form() {
        let json = serde_json::to_value(Schedule::interval(Duration::from_secs(300))).unwrap();
        assert_eq!(json["type"], "INTERVAL");
        assert_eq!(json["period"], "5m");

        let parsed: Schedule =
            serde_json::from_str(r#"{"type":"CRON","expression":"0 * * * *"}"#).unwrap();
        assert_eq!(parsed, Schedule::cron("0 * * * *"));
    }
}
