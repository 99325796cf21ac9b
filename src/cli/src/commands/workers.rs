//! Worker commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// List active workers
    List,

    /// Show one worker
    Get { name: String },

    /// Set the number of workers for a queue
    Resize {
        queue: String,

        /// Worker count; the server default applies when omitted
        count: Option<usize>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct CurrentJob {
    id: String,
    task_name: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct WorkerView {
    name: String,
    queue_names: Vec<String>,
    running: bool,
    #[serde(default)]
    current_job: Option<CurrentJob>,
    jobs_processed: u64,
    #[serde(default)]
    last_job_at: Option<DateTime<Utc>>,
    healthy: bool,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResizeRequest {
    queue_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

#[derive(Tabled)]
struct WorkerRow {
    #[tabled(rename = "Worker")]
    name: String,
    #[tabled(rename = "Queues")]
    queues: String,
    #[tabled(rename = "Current Job")]
    current: String,
    #[tabled(rename = "Processed")]
    processed: u64,
    #[tabled(rename = "Last Job")]
    last_job_at: String,
    #[tabled(rename = "Healthy")]
    healthy: String,
}

impl From<&WorkerView> for WorkerRow {
    fn from(w: &WorkerView) -> Self {
        Self {
            name: w.name.clone(),
            queues: w.queue_names.join(","),
            current: w
                .current_job
                .as_ref()
                .map(|j| format!("{} ({})", output::short_id(&j.id), j.task_name))
                .unwrap_or_else(|| "idle".to_string()),
            processed: w.jobs_processed,
            last_job_at: output::time(w.last_job_at),
            healthy: if w.healthy { "yes".into() } else { "no".into() },
        }
    }
}

pub async fn execute(cmd: WorkerCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        WorkerCommands::List => {
            let workers: Vec<WorkerView> = client.get("/workers").await?;
            let rows: Vec<WorkerRow> = workers.iter().map(WorkerRow::from).collect();
            output::print_list(&rows, &workers, format)?;
        }

        WorkerCommands::Get { name } => {
            let worker: WorkerView = client.get(&format!("/workers/{}", name)).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Worker: {}", worker.name));
                    output::print_detail("Queues", &worker.queue_names.join(", "));
                    output::print_detail("Running", &worker.running.to_string());
                    output::print_detail("Healthy", &worker.healthy.to_string());
                    output::print_detail("Processed", &worker.jobs_processed.to_string());
                    output::print_detail("Last job", &output::time(worker.last_job_at));
                    if let Some(job) = &worker.current_job {
                        output::print_detail(
                            "Current job",
                            &format!("{} ({}) since {}", job.id, job.task_name, output::time(Some(job.started_at))),
                        );
                    }
                }
                _ => output::print_item(&worker, format)?,
            }
        }

        WorkerCommands::Resize { queue, count } => {
            let body = ResizeRequest {
                queue_name: queue,
                count,
            };
            let resp: ResizeRequest = client.post("/workers/resize", &body).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Queue {} now has {} workers",
                    resp.queue_name,
                    resp.count.unwrap_or(0)
                )),
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}
