//! PostgreSQL storage backend.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! or double-claim the same row. Status updates lock the row, run the state
//! machine in Rust and write the result back in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use super::{JobFilter, JobStorage, StatusCounts};
use crate::config::StorageConfig;
use crate::error::{JobsError, Result};
use crate::jobs::job::{Job, JobFailure, JobId, JobStatus, Priority, StatusUpdate};
use crate::jobs::schedule::{Schedule, ScheduleDefinition, ScheduleFiring, ScheduleId};

const JOB_COLUMNS: &str = "id, queue_name, task_name, args, kwargs, priority, status, \
     created_at, updated_at, scheduled_at, started_at, completed_at, retries, max_retries, \
     retry_delay_ms, timeout_ms, result, error, metadata, tags, is_scheduled, worker_id";

const SCHEDULE_COLUMNS: &str = "id, name, task_name, queue_name, priority, args, kwargs, \
     max_retries, retry_delay_ms, timeout_ms, metadata, tags, schedule, enabled, next_run_at, \
     last_run_at, run_count, created_at, updated_at";

/// Job storage on a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect using the storage section of the configuration.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| JobsError::configuration("storage.url is required for the postgres backend"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;

        let storage = Self { pool };
        if config.run_migrations {
            storage.migrate().await?;
        }
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Job storage migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Mapping
// ═══════════════════════════════════════════════════════════════════════════════

fn corrupt(what: &str, detail: impl std::fmt::Display) -> JobsError {
    JobsError::storage(format!("Corrupt {} row: {}", what, detail))
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn json_array(value: Value, what: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(corrupt(what, format!("expected array, got {}", other))),
    }
}

fn json_object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(corrupt(what, format!("expected object, got {}", other))),
    }
}

fn priority_from_row(row: &PgRow, what: &str) -> Result<Priority> {
    let rank: i16 = row.try_get("priority")?;
    Priority::from_rank(rank).ok_or_else(|| corrupt(what, format!("priority {}", rank)))
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let error: Option<Value> = row.try_get("error")?;
    let retries: i32 = row.try_get("retries")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    let tags: Vec<String> = row.try_get("tags")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        queue_name: row.try_get("queue_name")?,
        task_name: row.try_get("task_name")?,
        args: json_array(row.try_get("args")?, "job")?,
        kwargs: json_object(row.try_get("kwargs")?, "job")?,
        priority: priority_from_row(row, "job")?,
        status: status.parse().map_err(|_| corrupt("job", format!("status {}", status)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        retries: u32::try_from(retries).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        retry_delay: from_millis(row.try_get("retry_delay_ms")?),
        timeout: row.try_get::<Option<i64>, _>("timeout_ms")?.map(from_millis),
        result: row.try_get("result")?,
        error: error.map(serde_json::from_value::<JobFailure>).transpose()?,
        metadata: json_object(row.try_get("metadata")?, "job")?,
        tags: tags.into_iter().collect(),
        is_scheduled: row.try_get("is_scheduled")?,
        worker_id: row.try_get("worker_id")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduleDefinition> {
    let schedule: Value = row.try_get("schedule")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    let run_count: i64 = row.try_get("run_count")?;
    let tags: Vec<String> = row.try_get("tags")?;

    Ok(ScheduleDefinition {
        id: ScheduleId(row.try_get("id")?),
        name: row.try_get("name")?,
        task_name: row.try_get("task_name")?,
        queue_name: row.try_get("queue_name")?,
        priority: priority_from_row(row, "schedule")?,
        args: json_array(row.try_get("args")?, "schedule")?,
        kwargs: json_object(row.try_get("kwargs")?, "schedule")?,
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        retry_delay: from_millis(row.try_get("retry_delay_ms")?),
        timeout: row.try_get::<Option<i64>, _>("timeout_ms")?.map(from_millis),
        metadata: json_object(row.try_get("metadata")?, "schedule")?,
        tags: tags.into_iter().collect(),
        schedule: serde_json::from_value::<Schedule>(schedule)?,
        enabled: row.try_get("enabled")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        run_count: u64::try_from(run_count).unwrap_or(0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl JobStorage for PostgresStorage {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn persist(&self, job: &Job) -> Result<JobId> {
        sqlx::query(
            r#"
            INSERT INTO uno_jobs (
                id, queue_name, task_name, args, kwargs, priority, status,
                created_at, updated_at, scheduled_at, started_at, completed_at,
                retries, max_retries, retry_delay_ms, timeout_ms, result, error,
                metadata, tags, is_scheduled, worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.queue_name)
        .bind(&job.task_name)
        .bind(Value::Array(job.args.clone()))
        .bind(Value::Object(job.kwargs.clone()))
        .bind(job.priority.rank())
        .bind(job.status.stored().as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i32(job.retries))
        .bind(to_i32(job.max_retries))
        .bind(to_millis(job.retry_delay))
        .bind(job.timeout.map(to_millis))
        .bind(&job.result)
        .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(Value::Object(job.metadata.clone()))
        .bind(job.tags.iter().cloned().collect::<Vec<_>>())
        .bind(job.is_scheduled)
        .bind(&job.worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobsError::duplicate_id("Job", job.id)
            }
            other => JobsError::from(other),
        })?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM uno_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {} FROM uno_jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| JobsError::not_found("Job", id.to_string()))?;

        let mut job = job_from_row(&row)?;
        job.apply(&update, now)?;

        sqlx::query(
            r#"
            UPDATE uno_jobs
            SET status = $2, updated_at = $3, scheduled_at = $4, started_at = $5,
                completed_at = $6, retries = $7, result = $8, error = $9, worker_id = $10
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(job.status.as_str())
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i32(job.retries))
        .bind(&job.result)
        .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&job.worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn get_jobs_by_status(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let stored: Vec<String> = filter
            .statuses
            .iter()
            .filter(|s| !matches!(s, JobStatus::Pending | JobStatus::Scheduled))
            .map(|s| s.as_str().to_string())
            .collect();

        let sql = format!(
            r#"
            SELECT {} FROM uno_jobs
            WHERE ($1::TEXT IS NULL OR queue_name = $1)
              AND ($2::TEXT IS NULL OR $2 = ANY(tags))
              AND (
                    $3
                 OR status = ANY($4::TEXT[])
                 OR (status = 'PENDING' AND $5 AND (scheduled_at IS NULL OR scheduled_at <= $7))
                 OR (status = 'PENDING' AND $6 AND scheduled_at > $7)
              )
            ORDER BY created_at, seq
            LIMIT $8 OFFSET $9
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(filter.queue_name.as_deref())
            .bind(filter.tag.as_deref())
            .bind(filter.statuses.is_empty())
            .bind(stored)
            .bind(filter.statuses.contains(&JobStatus::Pending))
            .bind(filter.statuses.contains(&JobStatus::Scheduled))
            .bind(Utc::now())
            .bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX))
            .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next(&self, queue_name: &str, worker_id: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM uno_jobs
                WHERE queue_name = $1
                  AND status = 'PENDING'
                  AND (scheduled_at IS NULL OR scheduled_at <= $3)
                ORDER BY priority DESC, created_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE uno_jobs
            SET status = 'RUNNING', started_at = $3, completed_at = NULL,
                updated_at = $3, worker_id = $2
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .bind(worker_id)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn clear_queue(&self, queue_name: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE uno_jobs
            SET status = 'CANCELLED', completed_at = $2, updated_at = $2
            WHERE queue_name = $1 AND status = 'PENDING'
            "#,
        )
        .bind(queue_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, queue_name: Option<&str>) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   (status = 'PENDING' AND scheduled_at IS NOT NULL AND scheduled_at > $2) AS deferred,
                   COUNT(*) AS n
            FROM uno_jobs
            WHERE ($1::TEXT IS NULL OR queue_name = $1)
            GROUP BY 1, 2
            "#,
        )
        .bind(queue_name)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let deferred: bool = row.try_get("deferred")?;
            let n: i64 = row.try_get("n")?;
            let status: JobStatus = if deferred {
                JobStatus::Scheduled
            } else {
                status.parse().map_err(|_| corrupt("job", format!("status {}", status)))?
            };
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT queue_name FROM uno_jobs
            UNION
            SELECT name FROM uno_job_queues
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn set_queue_paused(&self, queue_name: &str, paused: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO uno_job_queues (name, paused, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET paused = EXCLUDED.paused, updated_at = NOW()
            "#,
        )
        .bind(queue_name)
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn paused_queues(&self) -> Result<HashSet<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM uno_job_queues WHERE paused")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO uno_job_schedules (
                id, name, task_name, queue_name, priority, args, kwargs, max_retries,
                retry_delay_ms, timeout_ms, metadata, tags, schedule, enabled,
                next_run_at, last_run_at, run_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19)
            "#,
        )
        .bind(schedule.id.0)
        .bind(&schedule.name)
        .bind(&schedule.task_name)
        .bind(&schedule.queue_name)
        .bind(schedule.priority.rank())
        .bind(Value::Array(schedule.args.clone()))
        .bind(Value::Object(schedule.kwargs.clone()))
        .bind(to_i32(schedule.max_retries))
        .bind(to_millis(schedule.retry_delay))
        .bind(schedule.timeout.map(to_millis))
        .bind(Value::Object(schedule.metadata.clone()))
        .bind(schedule.tags.iter().cloned().collect::<Vec<_>>())
        .bind(serde_json::to_value(&schedule.schedule)?)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(i64::try_from(schedule.run_count).unwrap_or(i64::MAX))
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobsError::duplicate_id("Schedule", schedule.id)
            }
            other => JobsError::from(other),
        })?;
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>> {
        let sql = format!("SELECT {} FROM uno_job_schedules WHERE id = $1", SCHEDULE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let sql = format!(
            "SELECT {} FROM uno_job_schedules ORDER BY created_at, name",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE uno_job_schedules
            SET name = $2, task_name = $3, queue_name = $4, priority = $5, args = $6,
                kwargs = $7, max_retries = $8, retry_delay_ms = $9, timeout_ms = $10,
                metadata = $11, tags = $12, schedule = $13, enabled = $14,
                next_run_at = $15, updated_at = $16
            WHERE id = $1 AND run_count = $17
            "#,
        )
        .bind(schedule.id.0)
        .bind(&schedule.name)
        .bind(&schedule.task_name)
        .bind(&schedule.queue_name)
        .bind(schedule.priority.rank())
        .bind(Value::Array(schedule.args.clone()))
        .bind(Value::Object(schedule.kwargs.clone()))
        .bind(to_i32(schedule.max_retries))
        .bind(to_millis(schedule.retry_delay))
        .bind(schedule.timeout.map(to_millis))
        .bind(Value::Object(schedule.metadata.clone()))
        .bind(schedule.tags.iter().cloned().collect::<Vec<_>>())
        .bind(serde_json::to_value(&schedule.schedule)?)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(schedule.updated_at)
        .bind(i64::try_from(schedule.run_count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_schedule(schedule.id).await? {
            Some(_) => Ok(false),
            None => Err(JobsError::not_found("Schedule", schedule.id.to_string())),
        }
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM uno_job_schedules WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        let sql = format!(
            "SELECT {} FROM uno_job_schedules WHERE enabled AND next_run_at <= $1 ORDER BY next_run_at",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn claim_firing(&self, firing: &ScheduleFiring) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE uno_job_schedules
            SET last_run_at = $3, next_run_at = $4, run_count = run_count + 1,
                enabled = enabled AND NOT $5, updated_at = $3
            WHERE id = $1 AND enabled AND run_count = $2
            "#,
        )
        .bind(firing.schedule_id.0)
        .bind(i64::try_from(firing.run_count).unwrap_or(i64::MAX))
        .bind(firing.fired_at)
        .bind(firing.next_run_at)
        .bind(firing.disable)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revert_firing(&self, firing: &ScheduleFiring) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE uno_job_schedules
            SET last_run_at = $3, next_run_at = $4, run_count = $2,
                enabled = enabled OR $5, updated_at = NOW()
            WHERE id = $1 AND run_count = $2 + 1
            "#,
        )
        .bind(firing.schedule_id.0)
        .bind(i64::try_from(firing.run_count).unwrap_or(i64::MAX))
        .bind(firing.previous_last_run_at)
        .bind(firing.previous_next_run_at)
        .bind(firing.disable)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
