// Retrier binary entry point: drain the dead letter queues this deployment owns

use anyhow::{Context, Result};
use common::bootstrap;
use common::dlq::{DlqOwnership, RetryDaemon, RetryOptions};
use common::telemetry;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::load_settings()?;
    bootstrap::init_telemetry(&settings)?;

    let ownership = DlqOwnership::from_topology(&settings.topology, &settings.retry.owned_dlqs)
        .context("Invalid dead letter queue ownership")?;

    for owned in ownership.queues() {
        info!(
            dlq = %owned.dead_letter_queue,
            primary_queue = %owned.primary_queue,
            "Owning dead letter queue"
        );
    }

    let broker = bootstrap::init_broker(&settings, "retrier").await?;
    let broker = Arc::new(broker);
    let daemon = RetryDaemon::new(
        broker.clone(),
        settings.topology.exchange.clone(),
        ownership,
        RetryOptions::from(&settings.retry),
    );

    let shutdown = bootstrap::shutdown_on_signals();
    daemon.run(shutdown).await;

    broker.close().await;
    telemetry::shutdown_tracer();
    info!("Retrier stopped");
    Ok(())
}
