//! Queue commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List known queues
    List,

    /// Show one queue
    Get { name: String },

    /// Stop workers from claiming the queue's jobs
    Pause { name: String },

    /// Let workers claim the queue's jobs again
    Resume { name: String },

    /// Cancel every pending job in the queue
    Clear {
        name: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct QueueInfo {
    name: String,
    length: u64,
    paused: bool,
    workers: usize,
    #[serde(default)]
    counts: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ClearQueueResponse {
    queue_name: String,
    cleared: u64,
}

#[derive(Tabled)]
struct QueueRow {
    #[tabled(rename = "Queue")]
    name: String,
    #[tabled(rename = "Waiting")]
    length: u64,
    #[tabled(rename = "Running")]
    running: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Workers")]
    workers: usize,
    #[tabled(rename = "Paused")]
    paused: String,
}

impl From<&QueueInfo> for QueueRow {
    fn from(q: &QueueInfo) -> Self {
        Self {
            name: q.name.clone(),
            length: q.length,
            running: count(q, "RUNNING"),
            failed: count(q, "FAILED"),
            workers: q.workers,
            paused: if q.paused { "yes".into() } else { "no".into() },
        }
    }
}

fn count(q: &QueueInfo, status: &str) -> u64 {
    q.counts.get(status).copied().unwrap_or(0)
}

pub async fn execute(cmd: QueueCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        QueueCommands::List => {
            let queues: Vec<QueueInfo> = client.get("/queues").await?;
            let rows: Vec<QueueRow> = queues.iter().map(QueueRow::from).collect();
            output::print_list(&rows, &queues, format)?;
        }

        QueueCommands::Get { name } => {
            let queue: QueueInfo = client.get(&format!("/queues/{}", name)).await?;
            match format {
                OutputFormat::Table => print_queue(&queue),
                _ => output::print_item(&queue, format)?,
            }
        }

        QueueCommands::Pause { name } => {
            let queue: QueueInfo = client.post_empty(&format!("/queues/{}/pause", name)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Queue {} paused", queue.name)),
                _ => output::print_item(&queue, format)?,
            }
        }

        QueueCommands::Resume { name } => {
            let queue: QueueInfo = client.post_empty(&format!("/queues/{}/resume", name)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Queue {} resumed", queue.name)),
                _ => output::print_item(&queue, format)?,
            }
        }

        QueueCommands::Clear { name, force } => {
            if !force {
                output::print_info(&format!(
                    "This cancels every pending job in '{}'. Use --force to confirm.",
                    name
                ));
                return Ok(());
            }
            let resp: ClearQueueResponse = client.post_empty(&format!("/queues/{}/clear", name)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Cancelled {} pending jobs in {}",
                    resp.cleared, resp.queue_name
                )),
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

fn print_queue(queue: &QueueInfo) {
    output::print_header(&format!("Queue: {}", queue.name));
    output::print_detail("Waiting", &queue.length.to_string());
    output::print_detail("Workers", &queue.workers.to_string());
    output::print_detail("Paused", &queue.paused.to_string());
    for (status, n) in &queue.counts {
        output::print_detail(status, &n.to_string());
    }
}
