//! Worker pool for concurrent job execution.
//!
//! Each worker is one tokio task that repeatedly claims a job through
//! [`JobStorage::claim_next`], runs its handler and records the outcome.
//! Workers share nothing with each other except storage.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::job::{validate_queue_name, Job, JobFailure, JobId, JobStatus, StatusUpdate};
use super::monitoring::JobMetrics;
use super::registry::{TaskContext, TaskError, TaskRegistry, TaskResult};
use super::retry::{RetryDecision, RetryPolicy};
use super::storage::{JobStorage, StorageRetry};
use crate::config::WorkersConfig;
use crate::error::{JobsError, Result};

/// Upper bound for `resize`.
pub const MAX_WORKERS_PER_QUEUE: usize = 256;

/// Failure kind recorded for a panicking handler.
pub const PANIC_KIND: &str = "Panic";

/// Failure kind recorded for jobs interrupted by shutdown.
pub const SHUTDOWN_KIND: &str = "Shutdown";

// ═══════════════════════════════════════════════════════════════════════════════
// Worker State
// ═══════════════════════════════════════════════════════════════════════════════

/// The job a worker is executing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJob {
    pub id: JobId,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
}

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub queue_names: Vec<String>,
    pub running: bool,
    pub current_job: Option<CurrentJob>,
    /// Terminal outcomes only; retried attempts are not counted
    pub jobs_processed: u64,
    pub last_job_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
}

/// State shared between a worker task and the pool.
#[derive(Debug)]
pub struct WorkerState {
    name: String,
    queue_names: Vec<String>,
    running: AtomicBool,
    current: Mutex<Option<CurrentJob>>,
    jobs_processed: AtomicU64,
    last_job_at: Mutex<Option<DateTime<Utc>>>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    liveness_window: Duration,
    idle_window: Duration,
}

impl WorkerState {
    fn new(name: String, queue_names: Vec<String>, config: &WorkersConfig) -> Self {
        // an idle worker checks in at least once per poll round
        let idle_window = (config.poll_interval * 3 + config.claim_timeout).max(config.liveness_window);
        Self {
            name,
            queue_names,
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            jobs_processed: AtomicU64::new(0),
            last_job_at: Mutex::new(None),
            last_heartbeat: Mutex::new(Utc::now()),
            liveness_window: config.liveness_window,
            idle_window,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn current_job(&self) -> Option<CurrentJob> {
        self.current.lock().clone()
    }

    fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Utc::now();
    }

    fn begin(&self, job: &Job) {
        *self.current.lock() = Some(CurrentJob {
            id: job.id,
            task_name: job.task_name.clone(),
            started_at: job.started_at.unwrap_or_else(Utc::now),
            timeout: job.timeout,
        });
    }

    fn finish(&self, terminal: bool) {
        let now = Utc::now();
        *self.current.lock() = None;
        if terminal {
            self.jobs_processed.fetch_add(1, Ordering::Relaxed);
            *self.last_job_at.lock() = Some(now);
        }
        *self.last_heartbeat.lock() = now;
    }

    fn take_current(&self) -> Option<CurrentJob> {
        self.current.lock().take()
    }

    /// Healthy while running and not wedged.
    ///
    /// A busy worker is healthy until its job overruns its timeout (or the
    /// liveness window when the job has none). An idle worker is healthy
    /// while its poll loop keeps checking in.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_running() {
            return false;
        }
        if let Some(current) = self.current.lock().as_ref() {
            let budget = match current.timeout {
                Some(timeout) => timeout.saturating_add(self.idle_window),
                None => self.liveness_window,
            };
            return within(current.started_at, now, budget);
        }
        within(*self.last_heartbeat.lock(), now, self.idle_window)
    }

    pub fn info(&self) -> WorkerInfo {
        // each lock is released before the next is taken
        let last_job_at = *self.last_job_at.lock();
        let last_heartbeat = *self.last_heartbeat.lock();
        let healthy = self.is_healthy();
        WorkerInfo {
            name: self.name.clone(),
            queue_names: self.queue_names.clone(),
            running: self.is_running(),
            current_job: self.current_job(),
            jobs_processed: self.jobs_processed(),
            last_job_at,
            last_heartbeat,
            healthy,
        }
    }
}

fn within(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    // a timestamp in the future (clock step) counts as fresh
    (now - since).to_std().map_or(true, |elapsed| elapsed <= limit)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a worker needs, shared by the whole pool.
struct PoolContext {
    storage: Arc<dyn JobStorage>,
    registry: TaskRegistry,
    metrics: Arc<JobMetrics>,
    retry_policy: RetryPolicy,
    storage_retry: StorageRetry,
    config: WorkersConfig,
}

/// Aborts the handler task if the worker is dropped mid-job.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Worker {
    state: Arc<WorkerState>,
    ctx: Arc<PoolContext>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.state.name, queues = ?self.state.queue_names, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.heartbeat();

            if let Some(job) = self.claim().await {
                self.execute(job).await;
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
        info!(worker = %self.state.name, "Worker stopped");
    }

    /// Try each non-paused queue once.
    async fn claim(&self) -> Option<Job> {
        let storage = &self.ctx.storage;
        let paused = match self
            .ctx
            .storage_retry
            .run("paused_queues", || storage.paused_queues())
            .await
        {
            Ok(paused) => paused,
            Err(e) => {
                warn!(worker = %self.state.name, error = %e, "Could not read paused queues");
                self.ctx.metrics.record_storage_error("paused_queues");
                return None;
            }
        };

        for queue in &self.state.queue_names {
            if paused.contains(queue) {
                continue;
            }
            let attempt = tokio::time::timeout(
                self.ctx.config.claim_timeout,
                storage.claim_next(queue, &self.state.name),
            )
            .await;
            match attempt {
                Ok(Ok(Some(job))) => return Some(job),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(worker = %self.state.name, queue = %queue, error = %e, "Claim failed");
                    self.ctx.metrics.record_storage_error("claim_next");
                }
                Err(_) => {
                    warn!(
                        worker = %self.state.name,
                        queue = %queue,
                        timeout = ?self.ctx.config.claim_timeout,
                        "Claim timed out"
                    );
                    self.ctx.metrics.record_storage_error("claim_next");
                }
            }
        }
        None
    }

    async fn execute(&self, job: Job) {
        let span = info_span!(
            "job",
            job_id = %job.id,
            task = %job.task_name,
            queue = %job.queue_name,
            attempt = job.retries + 1,
            worker = %self.state.name,
        );
        self.process(job).instrument(span).await
    }

    async fn process(&self, job: Job) {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let eligible_since = job.scheduled_at.map_or(job.created_at, |at| at.max(job.created_at));
        let waited = (started_at - eligible_since).to_std().unwrap_or_default();
        self.ctx.metrics.record_started(&job.queue_name, &job.task_name, waited);
        debug!(waited_ms = waited.as_millis() as u64, "Job claimed");

        self.state.begin(&job);
        let clock = Instant::now();
        let outcome = self.run_handler(&job).await;
        let terminal = self.report(&job, outcome, clock.elapsed()).await;
        self.state.finish(terminal);
    }

    async fn run_handler(&self, job: &Job) -> TaskResult {
        let Some(handler) = self.ctx.registry.get(&job.task_name) else {
            return Err(JobsError::unknown_task(job.task_name.clone()).into());
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = TaskContext::new(job, cancel_rx);
        let mut handle = tokio::spawn(async move { handler.execute(ctx).await });
        let _guard = AbortOnDrop(handle.abort_handle());

        let joined = match job.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    let _ = cancel_tx.send(true);
                    handle.abort();
                    self.ctx.metrics.record_timed_out(&job.queue_name, &job.task_name);
                    warn!(timeout = ?limit, "Job timed out");
                    return Err(JobsError::timeout(format!("Job {}", job.id), limit).into());
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                Err(TaskError::new(panic_message(e.into_panic())).with_kind(PANIC_KIND))
            }
            Err(e) => Err(TaskError::new(e.to_string()).with_kind("Cancelled")),
        }
    }

    /// Record the outcome; returns whether the job reached a final state.
    async fn report(&self, job: &Job, outcome: TaskResult, elapsed: Duration) -> bool {
        let elapsed_ms = elapsed.as_millis() as u64;
        let (update, terminal) = match outcome {
            Ok(value) => {
                info!(elapsed_ms, "Job succeeded");
                (StatusUpdate::succeeded(value), true)
            }
            Err(err) => match self.ctx.retry_policy.decide(job, err.fatal, Utc::now()) {
                RetryDecision::RetryAt { retry, at } => {
                    warn!(
                        elapsed_ms,
                        error = %err,
                        retry,
                        max_retries = job.max_retries,
                        retry_at = %at,
                        "Job failed, retry scheduled"
                    );
                    (StatusUpdate::retry_at(retry, at, err.to_failure()), false)
                }
                RetryDecision::GiveUp => {
                    error!(elapsed_ms, error = %err, fatal = err.fatal, retries = job.retries, "Job failed");
                    (StatusUpdate::failed(err.to_failure()), true)
                }
            },
        };

        let storage = &self.ctx.storage;
        let to = update.to;
        let saved = self
            .ctx
            .storage_retry
            .run("update_status", || storage.update_status(job.id, update.clone()))
            .await;

        match saved {
            Ok(_) => {
                let metrics = &self.ctx.metrics;
                match (to, terminal) {
                    (_, false) => metrics.record_retried(&job.queue_name, &job.task_name, elapsed),
                    (JobStatus::Succeeded, true) => {
                        metrics.record_succeeded(&job.queue_name, &job.task_name, elapsed)
                    }
                    (_, true) => metrics.record_failed(&job.queue_name, &job.task_name, elapsed),
                }
                terminal
            }
            Err(e) => {
                error!(error = %e, status = %to, "Could not record job outcome");
                self.ctx.metrics.record_storage_error("update_status");
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "task panicked".to_string(),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

struct WorkerSlot {
    state: Arc<WorkerState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Per-queue sets of workers.
///
/// Queues listed in the configuration get their configured size. Any other
/// queue gets `default_concurrency` workers the first time a job is enqueued
/// to it, unless `resize` sized it first.
pub struct WorkerPool {
    ctx: Arc<PoolContext>,
    /// Target size per queue, from configuration, `resize` or first use
    sizes: Mutex<BTreeMap<String, usize>>,
    started: AtomicBool,
    slots: Mutex<BTreeMap<String, Vec<WorkerSlot>>>,
    /// Workers told to stop by a shrinking resize, still finishing a job
    retiring: Mutex<Vec<WorkerSlot>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        registry: TaskRegistry,
        metrics: Arc<JobMetrics>,
        config: WorkersConfig,
    ) -> Self {
        let sizes = config.queues.clone();
        Self {
            ctx: Arc::new(PoolContext {
                storage,
                registry,
                metrics,
                retry_policy: RetryPolicy::default(),
                storage_retry: StorageRetry::default(),
                config,
            }),
            sizes: Mutex::new(sizes),
            started: AtomicBool::new(false),
            slots: Mutex::new(BTreeMap::new()),
            retiring: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Must be called before `start`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.retry_policy = policy;
        }
        self
    }

    /// Must be called before `start`.
    pub fn with_storage_retry(mut self, retry: StorageRetry) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.storage_retry = retry;
        }
        self
    }

    pub fn config(&self) -> &WorkersConfig {
        &self.ctx.config
    }

    /// Spawn the configured workers, plus workers for queues that received
    /// jobs before the pool started.
    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let sizes = self.sizes.lock().clone();
        for (queue, count) in &sizes {
            self.resize(queue, *count)?;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Give `queue` `default_concurrency` workers if it has never been sized.
    pub fn ensure_queue(&self, queue: &str) {
        let count = self.ctx.config.default_concurrency;
        {
            let mut sizes = self.sizes.lock();
            if sizes.contains_key(queue) {
                return;
            }
            sizes.insert(queue.to_string(), count);
        }
        if !self.is_started() {
            return;
        }
        match self.resize(queue, count) {
            Ok(()) => info!(queue, workers = count, "Workers assigned to new queue"),
            Err(e) => warn!(queue, error = %e, "Could not assign workers to new queue"),
        }
    }

    /// Set the number of workers for `queue`.
    ///
    /// Growing spawns workers immediately. Shrinking tells the newest
    /// workers to stop once their current job is done.
    pub fn resize(&self, queue: &str, count: usize) -> Result<()> {
        validate_queue_name(queue)?;
        if count > MAX_WORKERS_PER_QUEUE {
            return Err(JobsError::validation(format!(
                "At most {} workers per queue",
                MAX_WORKERS_PER_QUEUE
            )));
        }

        self.sizes.lock().insert(queue.to_string(), count);

        let mut retired = Vec::new();
        let previous = {
            let mut slots = self.slots.lock();
            let workers = slots.entry(queue.to_string()).or_default();
            let previous = workers.len();
            while workers.len() < count {
                workers.push(self.spawn(queue));
            }
            while workers.len() > count {
                if let Some(slot) = workers.pop() {
                    let _ = slot.shutdown.send(true);
                    retired.push(slot);
                }
            }
            if workers.is_empty() {
                slots.remove(queue);
            }
            previous
        };

        let mut retiring = self.retiring.lock();
        retiring.retain(|slot| !slot.handle.is_finished());
        retiring.extend(retired);

        if previous != count {
            info!(queue, from = previous, to = count, "Worker pool resized");
        }
        Ok(())
    }

    fn spawn(&self, queue: &str) -> WorkerSlot {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}-{}", self.ctx.config.name_prefix, queue, n);
        let state = Arc::new(WorkerState::new(name, vec![queue.to_string()], &self.ctx.config));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            state: Arc::clone(&state),
            ctx: Arc::clone(&self.ctx),
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        WorkerSlot {
            state,
            shutdown,
            handle,
        }
    }

    /// Stop every worker.
    ///
    /// In-flight jobs get `shutdown_timeout` to finish. Jobs still running
    /// after that are aborted and put back to PENDING without spending a
    /// retry.
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        let mut slots: Vec<WorkerSlot> = std::mem::take(&mut *self.slots.lock())
            .into_values()
            .flatten()
            .collect();
        slots.append(&mut self.retiring.lock());
        if slots.is_empty() {
            return;
        }

        info!(workers = slots.len(), "Stopping workers");
        for slot in &slots {
            let _ = slot.shutdown.send(true);
        }

        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_timeout;
        for mut slot in slots {
            if tokio::time::timeout_at(deadline, &mut slot.handle).await.is_ok() {
                continue;
            }
            slot.handle.abort();
            let _ = (&mut slot.handle).await;
            slot.state.running.store(false, Ordering::SeqCst);
            if let Some(current) = slot.state.take_current() {
                self.release(&slot.state.name, current).await;
            }
        }
        info!("All workers stopped");
    }

    async fn release(&self, worker: &str, current: CurrentJob) {
        let failure = JobFailure::new(SHUTDOWN_KIND, format!("Interrupted by shutdown of worker {}", worker));
        match self
            .ctx
            .storage
            .update_status(current.id, StatusUpdate::released(failure))
            .await
        {
            Ok(_) => warn!(job_id = %current.id, worker, "Aborted job returned to queue"),
            Err(e) if e.is_invalid_transition() => {
                debug!(job_id = %current.id, "Aborted job had already finished")
            }
            Err(e) => {
                error!(job_id = %current.id, worker, error = %e, "Could not return aborted job to queue");
                self.ctx.metrics.record_storage_error("update_status");
            }
        }
    }

    /// All active workers, ordered by queue then start order.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.slots
            .lock()
            .values()
            .flatten()
            .map(|slot| slot.state.info())
            .collect()
    }

    pub fn worker(&self, name: &str) -> Result<WorkerInfo> {
        self.slots
            .lock()
            .values()
            .flatten()
            .find(|slot| slot.state.name == name)
            .map(|slot| slot.state.info())
            .ok_or_else(|| JobsError::not_found("Worker", name))
    }

    pub fn worker_count(&self) -> usize {
        self.slots.lock().values().map(Vec::len).sum()
    }

    /// Workers currently assigned to `queue`.
    pub fn concurrency(&self, queue: &str) -> usize {
        self.slots.lock().get(queue).map_or(0, Vec::len)
    }

    /// Queues with at least one worker.
    pub fn queues(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    /// True when every active worker is healthy.
    pub fn is_healthy(&self) -> bool {
        self.slots
            .lock()
            .values()
            .flatten()
            .all(|slot| slot.state.is_healthy())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queues", &self.queues())
            .field("workers", &self.worker_count())
            .finish()
    }
}
