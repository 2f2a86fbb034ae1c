// Scheduler binary entry point: one scheduler daemon per configured task kind

use anyhow::{Context, Result};
use common::bootstrap;
use common::db::TaskRepository;
use common::notify::PgChangeListener;
use common::scheduler::{RoutingKeyEventBuilder, SchedulerDaemon, SchedulerOptions};
use common::store::TaskStore;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::load_settings()?;
    bootstrap::init_telemetry(&settings)?;

    if settings.scheduler.daemons.is_empty() {
        anyhow::bail!("No scheduler daemons configured under [[scheduler.daemons]]");
    }

    info!(
        daemons = settings.scheduler.daemons.len(),
        notify_channel = %settings.database.notify_channel,
        "Starting scheduler"
    );

    let db_pool = bootstrap::init_database_pool(&settings).await?;
    let store: Arc<dyn TaskStore> = Arc::new(TaskRepository::new(db_pool.clone()));
    let options = SchedulerOptions::from(&settings.scheduler);

    // Every daemon gets its own listener connection and broker channel
    let mut daemons = Vec::with_capacity(settings.scheduler.daemons.len());
    for daemon_config in &settings.scheduler.daemons {
        let listener = PgChangeListener::connect(&db_pool, &settings.database.notify_channel)
            .await
            .with_context(|| format!("Failed to listen for '{}' changes", daemon_config.kind))?;
        let broker = bootstrap::init_broker(&settings, &daemon_config.kind).await?;

        let mut builder = RoutingKeyEventBuilder::new(&daemon_config.routing_key);
        if let Some(event_type) = &daemon_config.event_type {
            builder = builder.with_event_type(event_type);
        }

        let daemon = SchedulerDaemon::new(
            &daemon_config.kind,
            store.clone(),
            Box::new(listener),
            Arc::new(broker),
            settings.topology.exchange.clone(),
            Arc::new(builder),
            options.clone(),
        );
        daemon
            .validate(&settings.topology)
            .with_context(|| format!("Invalid scheduler daemon '{}'", daemon_config.kind))?;

        info!(
            kind = %daemon_config.kind,
            routing_key = %daemon_config.routing_key,
            "Scheduler daemon configured"
        );
        daemons.push(daemon);
    }

    let shutdown = bootstrap::shutdown_on_signals();
    let handles: Vec<_> = daemons
        .into_iter()
        .map(|daemon| {
            let kind = daemon.kind().to_string();
            (kind, tokio::spawn(daemon.run(shutdown.clone())))
        })
        .collect();

    for (kind, handle) in handles {
        if let Err(e) = handle.await {
            error!(kind = %kind, error = %e, "Scheduler daemon task failed");
        }
    }

    db_pool.close().await;
    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}
