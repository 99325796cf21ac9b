//! Schedule commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// List schedules
    List,

    /// Show one schedule
    Get { schedule_id: Uuid },

    /// Add a schedule; give exactly one of --cron, --every or --at
    #[command(group(ArgGroup::new("rule").required(true).args(["cron", "every", "at"])))]
    Add {
        /// Schedule name
        name: String,

        /// Registered task name
        task: String,

        /// Cron expression, 5 fields or 6/7 with seconds and year
        #[arg(long)]
        cron: Option<String>,

        /// Fixed interval in seconds
        #[arg(long)]
        every: Option<f64>,

        /// Fire once at this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Positional arguments as a JSON array
        #[arg(short, long)]
        args: Option<String>,

        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short, long)]
        priority: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Enable a schedule; its next run is recomputed from now
    Enable { schedule_id: Uuid },

    /// Disable a schedule
    Disable { schedule_id: Uuid },

    /// Delete a schedule
    Delete {
        schedule_id: Uuid,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateScheduleRequest {
    name: String,
    task_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_at: Option<DateTime<Utc>>,
    args: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    enabled: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct ScheduleView {
    id: String,
    name: String,
    task_name: String,
    queue_name: String,
    schedule: Value,
    enabled: bool,
    #[serde(default)]
    next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_run_at: Option<DateTime<Utc>>,
    run_count: u64,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DeletedResponse {
    id: String,
    deleted: bool,
}

#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Next Run")]
    next_run_at: String,
    #[tabled(rename = "Runs")]
    run_count: u64,
}

impl From<&ScheduleView> for ScheduleRow {
    fn from(s: &ScheduleView) -> Self {
        Self {
            id: output::short_id(&s.id),
            name: s.name.clone(),
            task: s.task_name.clone(),
            rule: describe_rule(&s.schedule),
            enabled: if s.enabled { "yes".into() } else { "no".into() },
            next_run_at: output::time(s.next_run_at),
            run_count: s.run_count,
        }
    }
}

/// Human form of the tagged `schedule` object.
fn describe_rule(rule: &Value) -> String {
    let field = |name: &str| rule.get(name).and_then(Value::as_str).unwrap_or("?").to_string();
    match rule.get("type").and_then(Value::as_str) {
        Some("CRON") => format!("cron {}", field("expression")),
        Some("INTERVAL") => format!("every {}", field("period")),
        Some("ONE_SHOT") => format!("once at {}", field("at")),
        _ => rule.to_string(),
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: ScheduleCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ScheduleCommands::List => {
            let schedules: Vec<ScheduleView> = client.get("/schedules").await?;
            let rows: Vec<ScheduleRow> = schedules.iter().map(ScheduleRow::from).collect();
            output::print_list(&rows, &schedules, format)?;
        }

        ScheduleCommands::Get { schedule_id } => {
            let schedule: ScheduleView = client.get(&format!("/schedules/{}", schedule_id)).await?;
            match format {
                OutputFormat::Table => print_schedule(&schedule),
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Add {
            name,
            task,
            cron,
            every,
            at,
            args,
            queue,
            priority,
            max_retries,
            disabled,
        } => {
            let args = match args {
                Some(raw) => serde_json::from_str::<Vec<Value>>(&raw)
                    .context("--args must be a JSON array")?,
                None => Vec::new(),
            };
            let body = CreateScheduleRequest {
                name,
                task_name: task,
                cron,
                interval_seconds: every,
                run_at: at,
                args,
                queue_name: queue,
                priority: priority.map(|p| p.to_uppercase()),
                max_retries,
                enabled: !disabled,
            };
            let schedule: ScheduleView = client.post("/schedules", &body).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Schedule {} added", schedule.id));
                    output::print_detail("Next run", &output::time(schedule.next_run_at));
                }
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Enable { schedule_id } => {
            let schedule: ScheduleView = client
                .post_empty(&format!("/schedules/{}/enable", schedule_id))
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Schedule {} enabled, next run {}",
                    schedule.name,
                    output::time(schedule.next_run_at)
                )),
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Disable { schedule_id } => {
            let schedule: ScheduleView = client
                .post_empty(&format!("/schedules/{}/disable", schedule_id))
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Schedule {} disabled", schedule.name)),
                _ => output::print_item(&schedule, format)?,
            }
        }

        ScheduleCommands::Delete { schedule_id, force } => {
            if !force {
                output::print_info("This deletes the schedule. Use --force to confirm.");
                return Ok(());
            }
            let resp: DeletedResponse = client.delete(&format!("/schedules/{}", schedule_id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Schedule {} deleted", resp.id)),
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

fn print_schedule(s: &ScheduleView) {
    output::print_header(&format!("Schedule: {}", s.name));
    output::print_detail("ID", &s.id);
    output::print_detail("Task", &s.task_name);
    output::print_detail("Queue", &s.queue_name);
    output::print_detail("Rule", &describe_rule(&s.schedule));
    output::print_detail("Enabled", &s.enabled.to_string());
    output::print_detail("Next run", &output::time(s.next_run_at));
    output::print_detail("Last run", &output::time(s.last_run_at));
    output::print_detail("Runs", &s.run_count.to_string());
}
