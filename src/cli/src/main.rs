//! unojobs - command-line client for the Uno Jobs engine.
//!
//! Talks to the HTTP API to submit and inspect jobs, manage queues and
//! schedules, resize worker pools and check engine health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;

use commands::{config, health, jobs, queues, schedules, workers};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Uno Jobs - background job engine CLI
#[derive(Parser)]
#[command(
    name = "unojobs",
    version,
    about = "Uno Jobs - background job engine",
    long_about = "CLI tool for submitting jobs and managing queues, schedules and workers.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "UNO_JOBS_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit and inspect jobs
    #[command(subcommand)]
    Jobs(jobs::JobCommands),

    /// Queue operations
    #[command(subcommand)]
    Queues(queues::QueueCommands),

    /// Recurring and one-shot schedules
    #[command(subcommand)]
    Schedules(schedules::ScheduleCommands),

    /// Worker pool operations
    #[command(subcommand)]
    Workers(workers::WorkerCommands),

    /// Check engine health
    Health(health::HealthArgs),

    /// Show engine summary
    Info,

    /// Show job metrics
    Metrics(health::MetricsArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // An unreadable settings file must not block `config reset`
    let settings = config::Settings::load().unwrap_or_default();
    let api_url = cli
        .api_url
        .clone()
        .or(settings.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let timeout = Duration::from_secs(settings.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let client = client::ApiClient::new(&api_url, timeout)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Jobs(cmd) => jobs::execute(cmd, &client, format).await,
        Commands::Queues(cmd) => queues::execute(cmd, &client, format).await,
        Commands::Schedules(cmd) => schedules::execute(cmd, &client, format).await,
        Commands::Workers(cmd) => workers::execute(cmd, &client, format).await,
        Commands::Health(args) => health::health(args, &client, format).await,
        Commands::Info => health::info(&client, format).await,
        Commands::Metrics(args) => health::metrics(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
