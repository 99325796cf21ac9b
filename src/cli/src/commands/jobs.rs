//! Job commands: list, get, submit, cancel and retry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Comma-separated statuses (PENDING, SCHEDULED, RUNNING, SUCCEEDED, FAILED, CANCELLED)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short, long)]
        tag: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one job
    Get { job_id: Uuid },

    /// Submit a job
    Submit {
        /// Registered task name
        task: String,

        /// Positional arguments as a JSON array
        #[arg(short, long)]
        args: Option<String>,

        /// Keyword argument as key=value; the value is parsed as JSON when possible
        #[arg(short, long = "kwarg")]
        kwargs: Vec<String>,

        #[arg(short, long)]
        queue: Option<String>,

        /// LOW, NORMAL, HIGH or CRITICAL
        #[arg(short, long)]
        priority: Option<String>,

        /// Run no earlier than this many seconds from now
        #[arg(long, conflicts_with = "at")]
        delay: Option<u64>,

        /// Run no earlier than this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Base delay between retries, in seconds
        #[arg(long)]
        retry_delay: Option<f64>,

        /// Per-attempt time limit, in seconds
        #[arg(long)]
        timeout: Option<f64>,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Cancel a pending job
    Cancel { job_id: Uuid },

    /// Requeue a failed job with a fresh retry budget
    Retry { job_id: Uuid },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateJobRequest {
    task_name: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_delay_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<f64>,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobFailure {
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobView {
    id: String,
    queue_name: String,
    task_name: String,
    priority: String,
    status: String,
    retries: u32,
    max_retries: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JobFailure>,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&JobView> for JobRow {
    fn from(job: &JobView) -> Self {
        Self {
            id: output::short_id(&job.id),
            task: job.task_name.clone(),
            queue: job.queue_name.clone(),
            priority: job.priority.clone(),
            status: output::status(&job.status),
            attempts: format!("{}/{}", job.retries, job.max_retries),
            created_at: output::time(Some(job.created_at)),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::List {
            status,
            queue,
            tag,
            limit,
            offset,
        } => {
            let mut path = format!("/jobs?limit={}&offset={}", limit, offset);
            if let Some(status) = status {
                path.push_str(&format!("&status={}", status.to_uppercase()));
            }
            if let Some(queue) = queue {
                path.push_str(&format!("&queue_name={}", queue));
            }
            if let Some(tag) = tag {
                path.push_str(&format!("&tag={}", tag));
            }

            let jobs: Vec<JobView> = client.get(&path).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, &jobs, format)?;
        }

        JobCommands::Get { job_id } => {
            let job: JobView = client.get(&format!("/jobs/{}", job_id)).await?;
            match format {
                OutputFormat::Table => print_job(&job),
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Submit {
            task,
            args,
            kwargs,
            queue,
            priority,
            delay,
            at,
            max_retries,
            retry_delay,
            timeout,
            tags,
        } => {
            let args = match args {
                Some(raw) => serde_json::from_str::<Vec<Value>>(&raw)
                    .context("--args must be a JSON array")?,
                None => Vec::new(),
            };
            let scheduled_at = match (delay, at) {
                (Some(secs), _) => Some(Utc::now() + chrono::Duration::seconds(secs as i64)),
                (None, at) => at,
            };
            let body = CreateJobRequest {
                task_name: task,
                args,
                kwargs: parse_kwargs(&kwargs)?,
                queue_name: queue,
                priority: priority.map(|p| p.to_uppercase()),
                scheduled_at,
                max_retries,
                retry_delay_seconds: retry_delay,
                timeout_seconds: timeout,
                tags,
            };

            let job: JobView = client.post("/jobs", &body).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} submitted", job.id));
                    output::print_detail("Queue", &job.queue_name);
                    output::print_detail("Status", &output::status(&job.status));
                }
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Cancel { job_id } => {
            let job: JobView = client.post_empty(&format!("/jobs/{}/cancel", job_id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Job {} cancelled", job.id)),
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Retry { job_id } => {
            let job: JobView = client.post_empty(&format!("/jobs/{}/retry", job_id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Job {} requeued", job.id)),
                _ => output::print_item(&job, format)?,
            }
        }
    }

    Ok(())
}

fn print_job(job: &JobView) {
    output::print_header(&format!("Job: {}", job.id));
    output::print_detail("Task", &job.task_name);
    output::print_detail("Queue", &job.queue_name);
    output::print_detail("Priority", &job.priority);
    output::print_detail("Status", &output::status(&job.status));
    output::print_detail("Attempts", &format!("{}/{}", job.retries, job.max_retries));
    output::print_detail("Created", &output::time(Some(job.created_at)));
    if job.scheduled_at.is_some() {
        output::print_detail("Scheduled", &output::time(job.scheduled_at));
    }
    output::print_detail("Started", &output::time(job.started_at));
    output::print_detail("Completed", &output::time(job.completed_at));
    if let Some(worker) = &job.worker_id {
        output::print_detail("Worker", worker);
    }
    if let Some(result) = &job.result {
        output::print_detail("Result", &result.to_string());
    }
    if let Some(error) = &job.error {
        output::print_detail("Error", &format!("{}: {}", error.kind, error.message));
    }
}

/// Parse `key=value` pairs; values that are not valid JSON are kept as strings.
fn parse_kwargs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut kwargs = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --kwarg '{}': expected key=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        kwargs.insert(key.to_string(), value);
    }
    Ok(kwargs)
}
