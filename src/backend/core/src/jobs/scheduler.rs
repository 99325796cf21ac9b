//! Schedule evaluation.
//!
//! A single tick loop scans storage for due schedules and fires each one
//! through the shared [`Enqueuer`]. Firing claims the slot first with a
//! conditional update and gives it back if the enqueue fails, so a slot is
//! fired at most once across scheduler instances and retried on the next
//! tick after a transient failure.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobId};
use super::monitoring::JobMetrics;
use super::queue::Enqueuer;
use super::schedule::{NewSchedule, ScheduleDefinition, ScheduleId, ScheduleUpdate};
use super::storage::{JobStorage, StorageRetry};
use crate::config::SchedulerConfig;
use crate::error::{JobsError, Result};

/// The scheduler counts as stalled after this long without a tick, or
/// two tick intervals, whichever is longer.
const MIN_STALL_THRESHOLD: Duration = Duration::from_secs(1);

/// Read-modify-write rounds a schedule edit gets against concurrent firings.
const MAX_EDIT_ATTEMPTS: usize = 5;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Jobs enqueued by this tick
    pub fired: Vec<JobId>,
    /// Due schedules another scheduler fired first
    pub skipped: usize,
    /// Due schedules whose firing failed and stays due
    pub failed: usize,
}

/// Scheduler liveness, as shown by the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub healthy: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tick Engine
// ═══════════════════════════════════════════════════════════════════════════════

struct SchedulerCore {
    storage: Arc<dyn JobStorage>,
    enqueuer: Enqueuer,
    metrics: Arc<JobMetrics>,
    retry: StorageRetry,
    config: SchedulerConfig,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
    consecutive_errors: AtomicU32,
}

impl SchedulerCore {
    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let storage = &self.storage;
        let due = self
            .retry
            .run("due_schedules", || storage.due_schedules(now))
            .await?;

        let mut report = TickReport::default();
        for schedule in due {
            // one bad schedule must not stop the others
            match self.fire(&schedule, now).await {
                Ok(Some(job)) => report.fired.push(job.id),
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_schedule_error(&schedule.name);
                    warn!(
                        schedule_id = %schedule.id,
                        schedule = %schedule.name,
                        error = %e,
                        "Schedule firing failed, will retry next tick"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn fire(&self, schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Option<Job>> {
        let firing = schedule.firing(now)?;
        let storage = &self.storage;

        if !self
            .retry
            .run("claim_firing", || storage.claim_firing(&firing))
            .await?
        {
            debug!(schedule_id = %schedule.id, "Schedule slot already fired elsewhere");
            return Ok(None);
        }

        match self.enqueuer.enqueue(schedule.to_new_job()).await {
            Ok(job) => {
                self.metrics.record_schedule_fired(&schedule.name);
                info!(
                    schedule_id = %schedule.id,
                    schedule = %schedule.name,
                    job_id = %job.id,
                    next_run_at = ?firing.next_run_at,
                    "Schedule fired"
                );
                Ok(Some(job))
            }
            Err(e) => {
                match self
                    .retry
                    .run("revert_firing", || storage.revert_firing(&firing))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        schedule_id = %schedule.id,
                        "Schedule changed before its failed firing could be reverted"
                    ),
                    Err(revert) => error!(
                        schedule_id = %schedule.id,
                        error = %revert,
                        "Could not revert failed schedule firing; this run is lost"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Run one tick and update liveness bookkeeping.
    async fn tick_and_record(&self) -> Result<TickReport> {
        let now = Utc::now();
        let outcome = self.tick(now).await;
        *self.last_tick_at.lock() = Some(Utc::now());

        let errored = match &outcome {
            Ok(report) => report.failed > 0 && report.fired.is_empty(),
            Err(e) => {
                error!(error = %e, "Scheduler tick failed");
                self.metrics.record_storage_error("due_schedules");
                true
            }
        };
        if errored {
            self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_errors.store(0, Ordering::Relaxed);
        }
        outcome
    }

    fn stall_threshold(&self) -> Duration {
        (self.config.tick_interval * 2).max(MIN_STALL_THRESHOLD)
    }

    fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.consecutive_errors.load(Ordering::Relaxed) >= self.config.max_consecutive_errors {
            return false;
        }
        let last_tick_at = *self.last_tick_at.lock();
        let since = last_tick_at.or(*self.started_at.lock());
        since.map_or(false, |at| {
            (now - at).to_std().map_or(true, |elapsed| elapsed <= self.stall_threshold())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

struct SchedulerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the tick loop and the schedule management operations.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    task: Mutex<Option<SchedulerTask>>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        enqueuer: Enqueuer,
        metrics: Arc<JobMetrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                storage,
                enqueuer,
                metrics,
                retry: StorageRetry::default(),
                config,
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
                last_tick_at: Mutex::new(None),
                consecutive_errors: AtomicU32::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Must be called before `start`.
    pub fn with_storage_retry(mut self, retry: StorageRetry) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.retry = retry;
        }
        self
    }

    /// Spawn the tick loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        core.running.store(true, Ordering::SeqCst);
        *core.started_at.lock() = Some(Utc::now());

        let handle = tokio::spawn(async move {
            info!(tick_interval = ?core.config.tick_interval, "Scheduler started");
            let mut ticker = tokio::time::interval(core.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let _ = core.tick_and_record().await;
                    }
                }
            }

            core.running.store(false, Ordering::SeqCst);
            info!("Scheduler stopped");
        });

        *task = Some(SchedulerTask { shutdown, handle });
    }

    /// Stop the tick loop, letting an in-progress tick finish.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.core.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Evaluate due schedules once, outside the tick loop.
    pub async fn tick(&self) -> Result<TickReport> {
        self.core.tick_and_record().await
    }

    /// False when the loop is stopped, stalled for more than two tick
    /// intervals, or failing tick after tick.
    pub fn is_healthy(&self) -> bool {
        self.core.is_healthy_at(Utc::now())
    }

    pub fn status(&self) -> SchedulerStatus {
        let last_tick_at = *self.core.last_tick_at.lock();
        let healthy = self.is_healthy();
        SchedulerStatus {
            running: self.is_running(),
            tick_interval: self.core.config.tick_interval,
            last_tick_at,
            consecutive_errors: self.core.consecutive_errors.load(Ordering::Relaxed),
            healthy,
        }
    }

    // ─── Schedule management ───────────────────────────────────────────────────

    pub async fn add_schedule(&self, request: NewSchedule) -> Result<ScheduleDefinition> {
        request.validate()?;
        let schedule = request.into_definition(Utc::now())?;
        self.core.storage.insert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            schedule = %schedule.name,
            rule = %schedule.schedule,
            next_run_at = ?schedule.next_run_at,
            "Schedule added"
        );
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> Result<ScheduleDefinition> {
        self.core
            .storage
            .get_schedule(id)
            .await?
            .ok_or_else(|| JobsError::not_found("Schedule", id.to_string()))
    }

    pub async fn get_all_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.core.storage.list_schedules().await
    }

    /// Re-read and re-apply `edit` until no firing lands between the read
    /// and the save.
    async fn edit_schedule<F>(&self, id: ScheduleId, mut edit: F) -> Result<ScheduleDefinition>
    where
        F: FnMut(&mut ScheduleDefinition, DateTime<Utc>) -> Result<()>,
    {
        for attempt in 1..=MAX_EDIT_ATTEMPTS {
            let mut schedule = self.get_schedule(id).await?;
            edit(&mut schedule, Utc::now())?;
            if self.core.storage.save_schedule(&schedule).await? {
                return self.get_schedule(id).await;
            }
            debug!(schedule_id = %id, attempt, "Schedule fired during edit, retrying");
        }
        Err(JobsError::internal(format!(
            "schedule {} kept firing during {} edit attempts",
            id, MAX_EDIT_ATTEMPTS
        )))
    }

    /// Apply a partial update; `next_run_at` is recomputed when the rule or
    /// the enabled flag changes.
    pub async fn update_schedule(&self, id: ScheduleId, update: ScheduleUpdate) -> Result<ScheduleDefinition> {
        let schedule = self
            .edit_schedule(id, |schedule, now| schedule.apply(update.clone(), now))
            .await?;
        info!(schedule_id = %id, next_run_at = ?schedule.next_run_at, "Schedule updated");
        Ok(schedule)
    }

    pub async fn enable_schedule(&self, id: ScheduleId) -> Result<ScheduleDefinition> {
        let schedule = self.edit_schedule(id, |schedule, now| schedule.enable(now)).await?;
        info!(schedule_id = %id, next_run_at = ?schedule.next_run_at, "Schedule enabled");
        Ok(schedule)
    }

    pub async fn disable_schedule(&self, id: ScheduleId) -> Result<ScheduleDefinition> {
        let schedule = self
            .edit_schedule(id, |schedule, now| {
                schedule.disable(now);
                Ok(())
            })
            .await?;
        info!(schedule_id = %id, "Schedule disabled");
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        if !self.core.storage.delete_schedule(id).await? {
            return Err(JobsError::not_found("Schedule", id.to_string()));
        }
        info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("status", &self.status()).finish()
    }
}
