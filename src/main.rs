//! Herald outbox worker daemon.
//!
//! Standalone entry point that drains the transactional outbox: loads
//! configuration from the environment, connects to PostgreSQL, runs
//! migrations, and supervises a pool of claim/process workers until a
//! shutdown signal arrives. Applications embedding Herald as a library wire
//! the same pieces themselves and register handlers before spawning the
//! pool.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{RegistryConfig, RegistryMode};
use herald_outbox::{storage, OutboxRegistry, WorkerConfig, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting herald outbox worker");

    let config = Config::from_env()?;
    let mut registry_config = RegistryConfig::from_env()?;
    // The daemon only makes sense against the database-backed registry.
    registry_config.mode = RegistryMode::Production;
    registry_config.validate()?;

    info!(
        worker_count = config.worker_count,
        batch_size = registry_config.outbox_batch_size,
        max_retries = registry_config.max_retries,
        dead_letter_enabled = registry_config.dead_letter_enabled,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    storage::run_migrations(&pool).await.context("failed to run outbox migrations")?;
    info!("database migrations completed");

    let registry = Arc::new(OutboxRegistry::new(pool.clone(), registry_config));

    let worker_config = WorkerConfig {
        worker_count: config.worker_count,
        poll_interval: config.poll_interval,
        ..Default::default()
    };
    let mut worker_pool = WorkerPool::new(registry, worker_config);
    worker_pool.spawn_workers().await;

    info!("herald is draining the outbox");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    worker_pool.shutdown_graceful().await.context("worker pool shutdown failed")?;

    pool.close().await;
    info!("database connections closed, herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with startup retry.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_connect_error) if retries < MAX_RETRIES => {
                retries += 1;
                info!(attempt = retries, max_retries = MAX_RETRIES, "database connection failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(connect_error) => {
                return Err(connect_error)
                    .context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received CTRL+C signal"),
        _ = terminate => info!("received SIGTERM signal"),
    }
}

/// Daemon configuration.
struct Config {
    /// PostgreSQL connection string.
    database_url: String,
    /// Maximum database connections.
    database_max_connections: u32,
    /// Number of outbox workers.
    worker_count: usize,
    /// Idle poll interval.
    poll_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(10);

        let worker_count = std::env::var("HERALD_WORKER_COUNT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(herald_outbox::DEFAULT_WORKER_COUNT);

        let poll_interval = std::env::var("HERALD_POLL_INTERVAL_SECONDS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(herald_outbox::DEFAULT_POLL_INTERVAL_SECONDS));

        Ok(Self { database_url, database_max_connections, worker_count, poll_interval })
    }
}
