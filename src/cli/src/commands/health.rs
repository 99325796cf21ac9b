//! Engine commands: health, info and metrics.
//!
//! Health queries the `/health` endpoint and displays component status.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include detailed component checks
    #[arg(short, long)]
    detailed: bool,
}

#[derive(Args)]
pub struct MetricsArgs {
    /// Print the Prometheus exposition instead of the JSON counters
    #[arg(long)]
    prometheus: bool,
}

fn str_field<'a>(value: &'a Value, name: &str) -> &'a str {
    value.get(name).and_then(Value::as_str).unwrap_or("?")
}

pub async fn health(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    // 503 still carries the full report
    let (_, body) = client.get_raw("/health").await?;
    let health = body.get("data").cloned().unwrap_or(body);

    match format {
        OutputFormat::Table => {
            let status = str_field(&health, "status");
            let healthy = health.get("healthy").and_then(Value::as_bool).unwrap_or(false);

            output::print_header("Engine Health");
            output::print_detail("Status", status);
            output::print_detail("API URL", client.base_url());
            output::print_detail("Version", str_field(&health, "version"));
            if let Some(uptime) = health.get("uptime_secs").and_then(Value::as_u64) {
                output::print_detail("Uptime", &format!("{}s", uptime));
            }

            if args.detailed {
                if let Some(components) = health.get("components").and_then(Value::as_array) {
                    output::print_header("Components");
                    for comp in components {
                        let line = match comp.get("message").and_then(Value::as_str) {
                            Some(message) => format!("{} ({})", str_field(comp, "status"), message),
                            None => str_field(comp, "status").to_string(),
                        };
                        output::print_detail(str_field(comp, "name"), &line);
                    }
                }
            }

            println!();
            if healthy {
                output::print_success("All components operational");
            } else {
                output::print_error(&format!("Engine status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}

pub async fn info(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let info: Value = client.get("/info").await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Uno Jobs");
            output::print_detail("Version", str_field(&info, "version"));
            for key in ["workers", "schedules", "enabled_schedules", "total_jobs"] {
                if let Some(n) = info.get(key).and_then(Value::as_u64) {
                    output::print_detail(key, &n.to_string());
                }
            }
            if let Some(counts) = info.get("counts").and_then(Value::as_object) {
                output::print_header("Jobs by status");
                for (status, n) in counts {
                    output::print_detail(status, &n.to_string());
                }
            }
            if let Some(queues) = info.get("queues").and_then(Value::as_array) {
                output::print_header("Queues");
                for q in queues {
                    let length = q.get("length").and_then(Value::as_u64).unwrap_or(0);
                    let paused = q.get("paused").and_then(Value::as_bool).unwrap_or(false);
                    let suffix = if paused { " (paused)" } else { "" };
                    output::print_detail(str_field(q, "name"), &format!("{} waiting{}", length, suffix));
                }
            }
            if let Some(tasks) = info.get("registered_tasks").and_then(Value::as_array) {
                let names: Vec<&str> = tasks.iter().filter_map(Value::as_str).collect();
                output::print_header("Tasks");
                println!("  {}", names.join(", "));
            }
        }
        _ => output::print_item(&info, format)?,
    }

    Ok(())
}

pub async fn metrics(args: MetricsArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    if args.prometheus {
        print!("{}", client.get_text("/metrics/prometheus").await?);
        return Ok(());
    }

    let metrics: Value = client.get("/metrics").await?;
    match format {
        OutputFormat::Table => {
            output::print_header("Job Metrics");
            if let Some(fields) = metrics.as_object() {
                for (name, value) in fields {
                    output::print_detail(name, &value.to_string());
                }
            }
        }
        _ => output::print_item(&metrics, format)?,
    }
    Ok(())
}
