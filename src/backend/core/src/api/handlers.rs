//! Admin API handlers.
//!
//! All handlers return `Result<impl IntoResponse, JobsError>` so that errors
//! are converted to status codes by the `IntoResponse` implementation on
//! `JobsError`. Ids and enum names are parsed here, so malformed values are
//! 400s rather than extractor rejections.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::extract::{ApiJson, ApiQuery};
use super::{ApiResponse, AppState};
use crate::error::{JobsError, Result};
use crate::jobs::storage::{JobFilter, DEFAULT_LIST_LIMIT};
use crate::jobs::{
    Job, JobId, JobStatus, NewJob, NewSchedule, Priority, Schedule, ScheduleId, ScheduleUpdate,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn info(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.info().await?)))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.manager.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ApiResponse {
            success: report.healthy,
            data: Some(report),
        }),
    )
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.manager.metrics()))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queues
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearQueueResponse {
    pub queue_name: String,
    pub cleared: u64,
}

pub async fn list_queues(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.get_queues().await?)))
}

pub async fn get_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.get_queue(&name).await?)))
}

pub async fn clear_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let cleared = state.manager.clear_queue(&name).await?;
    Ok(Json(ApiResponse::success(ClearQueueResponse {
        queue_name: name,
        cleared,
    })))
}

pub async fn pause_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.pause_queue(&name).await?)))
}

pub async fn resume_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.resume_queue(&name).await?)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Comma-separated status names
    pub status: Option<String>,
    pub queue_name: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter> {
        let mut filter = JobFilter::default();
        if let Some(statuses) = self.status {
            for name in statuses.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                filter = filter.status(name.parse::<JobStatus>()?);
            }
        }
        if let Some(queue) = self.queue_name {
            filter = filter.queue(queue);
        }
        if let Some(tag) = self.tag {
            filter = filter.tag(tag);
        }
        Ok(filter.page(
            self.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            self.offset.unwrap_or(0),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub queue_name: Option<String>,
    pub priority: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<f64>,
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CreateJobRequest {
    pub fn into_new_job(self) -> Result<NewJob> {
        let mut job = NewJob::new(self.task_name).args(self.args);
        job.kwargs = self.kwargs;
        job.metadata = self.metadata;
        job.tags = self.tags.into_iter().collect();
        if let Some(queue) = self.queue_name {
            job = job.queue(queue);
        }
        if let Some(priority) = self.priority {
            job = job.priority(priority.parse::<Priority>()?);
        }
        if let Some(at) = self.scheduled_at {
            job = job.scheduled_at(at);
        }
        if let Some(max_retries) = self.max_retries {
            job = job.max_retries(max_retries);
        }
        if let Some(delay) = self.retry_delay_seconds {
            job = job.retry_delay(seconds("retry_delay_seconds", delay)?);
        }
        if let Some(timeout) = self.timeout_seconds {
            job = job.timeout(seconds("timeout_seconds", timeout)?);
        }
        Ok(job)
    }
}

/// A job as reported over the API: PENDING jobs waiting on a future
/// `scheduled_at` show as SCHEDULED.
fn present(mut job: Job) -> Job {
    job.status = job.effective_status(Utc::now());
    job
}

pub async fn list_jobs(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListJobsQuery>,
) -> Result<impl IntoResponse> {
    let filter = query.into_filter()?;
    let jobs: Vec<Job> = state
        .manager
        .list_jobs(&filter)
        .await?
        .into_iter()
        .map(present)
        .collect();
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn create_job(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateJobRequest>,
) -> Result<impl IntoResponse> {
    let job = state.manager.enqueue(req.into_new_job()?).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(present(job)))))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let job = state.manager.get_job(id.parse::<JobId>()?).await?;
    Ok(Json(ApiResponse::success(present(job))))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let job = state.manager.cancel_job(id.parse::<JobId>()?).await?;
    Ok(Json(ApiResponse::success(present(job))))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let job = state.manager.retry_job(id.parse::<JobId>()?).await?;
    Ok(Json(ApiResponse::success(present(job))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════════

/// `count` defaults to `workers.default_concurrency`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub queue_name: String,
    #[serde(default)]
    pub count: Option<usize>,
}

pub async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.manager.workers()))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(state.manager.worker(&name)?)))
}

pub async fn resize_workers(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ResizeRequest>,
) -> Result<impl IntoResponse> {
    let pool = state.manager.pool();
    let count = req.count.unwrap_or(pool.config().default_concurrency);
    state.manager.resize_pool(&req.queue_name, count)?;
    Ok(Json(ApiResponse::success(ResizeRequest {
        count: Some(pool.concurrency(&req.queue_name)),
        queue_name: req.queue_name,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedules
// ═══════════════════════════════════════════════════════════════════════════════

/// Exactly one of `cron`, `interval_seconds` and `run_at` selects the
/// schedule kind.
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub task_name: String,
    pub cron: Option<String>,
    pub interval_seconds: Option<f64>,
    pub run_at: Option<DateTime<Utc>>,
    pub queue_name: Option<String>,
    pub priority: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<f64>,
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub enabled: Option<bool>,
}

impl CreateScheduleRequest {
    pub fn into_new_schedule(self) -> Result<NewSchedule> {
        let schedule = schedule_from_fields(self.cron, self.interval_seconds, self.run_at)?
            .ok_or_else(|| {
                JobsError::validation("One of cron, interval_seconds or run_at is required")
            })?;

        let mut request = NewSchedule::new(self.name, self.task_name, schedule).args(self.args);
        request.kwargs = self.kwargs;
        request.metadata = self.metadata;
        request.tags = self.tags.into_iter().collect();
        if let Some(queue) = self.queue_name {
            request = request.queue(queue);
        }
        if let Some(priority) = self.priority {
            request = request.priority(priority.parse::<Priority>()?);
        }
        if let Some(max_retries) = self.max_retries {
            request = request.max_retries(max_retries);
        }
        if let Some(delay) = self.retry_delay_seconds {
            request.retry_delay = seconds("retry_delay_seconds", delay)?;
        }
        if let Some(timeout) = self.timeout_seconds {
            request.timeout = Some(seconds("timeout_seconds", timeout)?);
        }
        if self.enabled == Some(false) {
            request = request.disabled();
        }
        Ok(request)
    }
}

/// Partial schedule update. Absent fields are left alone;
/// `"timeout_seconds": null` clears the timeout.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub task_name: Option<String>,
    pub cron: Option<String>,
    pub interval_seconds: Option<f64>,
    pub run_at: Option<DateTime<Utc>>,
    pub queue_name: Option<String>,
    pub priority: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<f64>,
    #[serde(default, deserialize_with = "double_option")]
    pub timeout_seconds: Option<Option<f64>>,
    pub metadata: Option<Map<String, Value>>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

impl UpdateScheduleRequest {
    pub fn into_update(self) -> Result<ScheduleUpdate> {
        Ok(ScheduleUpdate {
            schedule: schedule_from_fields(self.cron, self.interval_seconds, self.run_at)?,
            name: self.name,
            task_name: self.task_name,
            queue_name: self.queue_name,
            priority: self.priority.map(|p| p.parse::<Priority>()).transpose()?,
            args: self.args,
            kwargs: self.kwargs,
            max_retries: self.max_retries,
            retry_delay: self
                .retry_delay_seconds
                .map(|s| seconds("retry_delay_seconds", s))
                .transpose()?,
            timeout: self
                .timeout_seconds
                .map(|t| t.map(|s| seconds("timeout_seconds", s)).transpose())
                .transpose()?,
            metadata: self.metadata,
            tags: self.tags.map(|tags| tags.into_iter().collect()),
            enabled: self.enabled,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub id: String,
    pub deleted: bool,
}

pub async fn list_schedules(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(
        state.manager.scheduler().get_all_schedules().await?,
    )))
}

pub async fn create_schedule(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateScheduleRequest>,
) -> Result<impl IntoResponse> {
    let schedule = state
        .manager
        .scheduler()
        .add_schedule(req.into_new_schedule()?)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(schedule))))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = id.parse::<ScheduleId>()?;
    Ok(Json(ApiResponse::success(
        state.manager.scheduler().get_schedule(id).await?,
    )))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpdateScheduleRequest>,
) -> Result<impl IntoResponse> {
    let id = id.parse::<ScheduleId>()?;
    let schedule = state
        .manager
        .scheduler()
        .update_schedule(id, req.into_update()?)
        .await?;
    Ok(Json(ApiResponse::success(schedule)))
}

pub async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = id.parse::<ScheduleId>()?;
    Ok(Json(ApiResponse::success(
        state.manager.scheduler().enable_schedule(id).await?,
    )))
}

pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = id.parse::<ScheduleId>()?;
    Ok(Json(ApiResponse::success(
        state.manager.scheduler().disable_schedule(id).await?,
    )))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = id.parse::<ScheduleId>()?;
    state.manager.scheduler().delete_schedule(id).await?;
    Ok(Json(ApiResponse::success(DeletedResponse {
        id: id.to_string(),
        deleted: true,
    })))
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        JobsError::validation(format!("{} must be a non-negative number of seconds", field))
    })
}

fn schedule_from_fields(
    cron: Option<String>,
    interval_seconds: Option<f64>,
    run_at: Option<DateTime<Utc>>,
) -> Result<Option<Schedule>> {
    let given = [cron.is_some(), interval_seconds.is_some(), run_at.is_some()]
        .iter()
        .filter(|g| **g)
        .count();
    if given > 1 {
        return Err(JobsError::validation(
            "Only one of cron, interval_seconds or run_at may be given",
        ));
    }

    if let Some(expression) = cron {
        return Ok(Some(Schedule::cron(expression)));
    }
    if let Some(secs) = interval_seconds {
        return Ok(Some(Schedule::interval(seconds("interval_seconds", secs)?)));
    }
    Ok(run_at.map(Schedule::one_shot))
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
