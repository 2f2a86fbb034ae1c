// Bootstrap utilities shared by the scheduler and retrier binaries

use crate::config::Settings;
use crate::db::DbPool;
use crate::queue::{AmqpBroker, Broker};
use crate::shutdown::{self, ShutdownSignal};
use crate::telemetry;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info};

/// Load and validate the layered configuration
pub fn load_settings() -> Result<Settings> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(settings)
}

/// Install JSON logging, optional OTLP export and the Prometheus exporter
pub fn init_telemetry(settings: &Settings) -> Result<()> {
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;
    Ok(())
}

/// Initialize database pool, applying migrations when configured
///
/// # Errors
/// Returns error if the pool cannot connect or a migration fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    if settings.database.run_migrations {
        db_pool
            .migrate()
            .await
            .context("Failed to apply database migrations")?;
    }

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Open a broker connection and declare the full topology on it.
///
/// Each daemon calls this for its own connection; the declaration is idempotent.
///
/// # Errors
/// Returns error if the connection fails or the broker rejects a declaration
/// (for example a queue that already exists with other arguments)
#[tracing::instrument(skip(settings))]
pub async fn init_broker(settings: &Settings, owner: &str) -> Result<AmqpBroker> {
    info!("Initializing broker connection");

    let broker = AmqpBroker::connect(
        &settings.broker.url,
        Duration::from_secs(settings.broker.publish_timeout_seconds),
    )
    .await
    .context("Failed to connect to broker")?;

    broker
        .declare_topology(&settings.topology)
        .await
        .context("Failed to declare broker topology")?;

    info!(
        exchange = %settings.topology.exchange,
        queues = settings.topology.bindings.len(),
        "Broker connection initialized"
    );
    Ok(broker)
}

/// Trip the returned signal on Ctrl+C or SIGTERM
pub fn shutdown_on_signals() -> ShutdownSignal {
    let (trigger, signal) = shutdown::channel();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing in-flight work");
        trigger.trigger();
    });

    signal
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                }
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
}
