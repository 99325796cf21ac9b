//! Uno Jobs server: the job engine plus its admin HTTP API.

use clap::Parser;
use std::sync::Arc;

use uno_jobs::{
    api::{self, AppState},
    config::{Config, StorageBackend, StorageConfig},
    jobs::{register_builtins, InMemoryStorage, JobManager, JobStorage, PostgresStorage, TaskRegistry},
    telemetry::{self, SERVICE_NAME},
};

#[derive(Debug, Parser)]
#[command(name = "uno-jobs-server", version, about = "Uno background job server")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment variables
    /// prefixed `UNO_JOBS__` override it
    #[arg(short, long, env = "UNO_JOBS_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_logging(&config.logging)?;
    let metrics = telemetry::init_metrics(&config.metrics, SERVICE_NAME)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting Uno Jobs server"
    );

    let storage = build_storage(&config.storage).await?;

    let registry = TaskRegistry::new();
    register_builtins(&registry);

    let manager = Arc::new(JobManager::from_config(storage, registry, &config));
    manager.start()?;

    let app = api::build_router(AppState::new(Arc::clone(&manager), metrics));

    let addr = config.server.bind_address();
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

async fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn JobStorage>> {
    let storage: Arc<dyn JobStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
        StorageBackend::Postgres => Arc::new(PostgresStorage::connect(config).await?),
    };
    storage.ping().await?;
    tracing::info!(backend = storage.backend_name(), "Storage ready");
    Ok(storage)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
