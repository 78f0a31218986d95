//! jobmill worker daemon.
//!
//! Connects to Postgres, runs the job engine with the built-in handlers and
//! shuts down gracefully on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobmill_db::{Database, PoolConfig};
use jobmill_jobs::{EchoHandler, HandlerRegistry, JobManager, NoOpHandler, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
    //   RUST_LOG    - standard env filter (default: "jobmill_jobs=info,jobmill_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "jobmill_jobs=info,jobmill_db=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("jobmill-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;

    let migrate = std::env::args().any(|arg| arg == "--migrate")
        || std::env::var("JOB_DB_MIGRATE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
    if migrate {
        db.migrate().await.context("failed to run migrations")?;
        info!(subsystem = "database", "Migrations applied");
    }

    let registry = HandlerRegistry::new()
        .with_handler(EchoHandler)
        .with_handler(NoOpHandler::new("noop"));
    info!(handlers = ?registry.paths(), "Registered job handlers");

    let config = WorkerConfig::from_env();
    let shutdown_timeout = config.shutdown_timeout;
    let manager = JobManager::new(Arc::new(db.jobs.clone()), registry, config);
    manager.init();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let drained = manager.shutdown(shutdown_timeout).await;
    info!(drained, "jobmill-worker exited");
    Ok(())
}
