//! Job engine metrics.
//!
//! [`JobMetrics`] keeps process-local counters for the `/jobs/metrics`
//! snapshot and mirrors every event to the `metrics` facade so the
//! Prometheus exporter sees the same numbers.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for everything the engine does to jobs.
#[derive(Debug)]
pub struct JobMetrics {
    enqueued: AtomicU64,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    schedule_firings: AtomicU64,
    schedule_errors: AtomicU64,
    storage_errors: AtomicU64,
    total_run_micros: AtomicU64,
    finished_runs: AtomicU64,
    total_wait_micros: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            schedule_firings: AtomicU64::new(0),
            schedule_errors: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            total_run_micros: AtomicU64::new(0),
            finished_runs: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_enqueued(&self, queue: &str, task: &str) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("uno_jobs_enqueued_total", "queue" => queue.to_string(), "task" => task.to_string())
            .increment(1);
    }

    /// A worker claimed a job that had been eligible for `waited`.
    pub fn record_started(&self, queue: &str, task: &str, waited: Duration) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.total_wait_micros.fetch_add(micros(waited), Ordering::Relaxed);
        counter!("uno_jobs_started_total", "queue" => queue.to_string(), "task" => task.to_string())
            .increment(1);
        histogram!("uno_jobs_queue_wait_seconds", "queue" => queue.to_string()).record(waited.as_secs_f64());
    }

    pub fn record_succeeded(&self, queue: &str, task: &str, elapsed: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_run(queue, task, "succeeded", elapsed);
    }

    pub fn record_failed(&self, queue: &str, task: &str, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_run(queue, task, "failed", elapsed);
    }

    pub fn record_retried(&self, queue: &str, task: &str, elapsed: Duration) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.record_run(queue, task, "retried", elapsed);
    }

    pub fn record_timed_out(&self, queue: &str, task: &str) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        counter!("uno_jobs_timeouts_total", "queue" => queue.to_string(), "task" => task.to_string())
            .increment(1);
    }

    pub fn record_cancelled(&self, n: u64) {
        self.cancelled.fetch_add(n, Ordering::Relaxed);
        counter!("uno_jobs_cancelled_total").increment(n);
    }

    pub fn record_schedule_fired(&self, schedule: &str) {
        self.schedule_firings.fetch_add(1, Ordering::Relaxed);
        counter!("uno_jobs_schedule_firings_total", "schedule" => schedule.to_string()).increment(1);
    }

    pub fn record_schedule_error(&self, schedule: &str) {
        self.schedule_errors.fetch_add(1, Ordering::Relaxed);
        counter!("uno_jobs_schedule_errors_total", "schedule" => schedule.to_string()).increment(1);
    }

    pub fn record_storage_error(&self, operation: &'static str) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
        counter!("uno_jobs_storage_errors_total", "operation" => operation).increment(1);
    }

    fn record_run(&self, queue: &str, task: &str, outcome: &'static str, elapsed: Duration) {
        self.total_run_micros.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.finished_runs.fetch_add(1, Ordering::Relaxed);
        counter!(
            "uno_jobs_finished_total",
            "queue" => queue.to_string(),
            "task" => task.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            "uno_jobs_run_duration_seconds",
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let finished_runs = self.finished_runs.load(Ordering::Relaxed);
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            started,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            schedule_firings: self.schedule_firings.load(Ordering::Relaxed),
            schedule_errors: self.schedule_errors.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            avg_run_ms: average_ms(self.total_run_micros.load(Ordering::Relaxed), finished_runs),
            avg_wait_ms: average_ms(self.total_wait_micros.load(Ordering::Relaxed), started),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn average_ms(total_micros: u64, n: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        total_micros as f64 / n as f64 / 1000.0
    }
}

/// Point-in-time copy of [`JobMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub started: u64,
    pub succeeded: u64,
    /// Final failures only; attempts that were retried count under `retried`
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub schedule_firings: u64,
    pub schedule_errors: u64,
    pub storage_errors: u64,
    pub avg_run_ms: f64,
    /// Mean time between becoming eligible and being claimed
    pub avg_wait_ms: f64,
    pub uptime_seconds: u64,
}
