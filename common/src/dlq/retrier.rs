// Retry daemon: drain owned dead letter queues back into the primary exchange

use crate::config::RetryConfig;
use crate::dlq::ownership::{DlqOwnership, OwnedQueue};
use crate::queue::{Broker, DeadLetterEnvelope};
use crate::shutdown::ShutdownSignal;
use crate::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Pause between drain cycles. Kept coarse so a systemic failure is not re-fed quickly.
    pub poll_interval: Duration,
    /// Longest wait for a single message before the queue counts as drained
    pub consume_timeout: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(900),
            consume_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&RetryConfig> for RetryOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            consume_timeout: config.consume_timeout(),
        }
    }
}

/// Result of draining one DLQ once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dead_letter_queue: String,
    /// Messages counted at the start of the cycle
    pub depth: u32,
    pub republished: u32,
    pub failed: u32,
}

impl DrainReport {
    fn new(dead_letter_queue: &str) -> Self {
        Self {
            dead_letter_queue: dead_letter_queue.to_string(),
            ..Self::default()
        }
    }
}

/// Periodic drainer for the DLQs of one ownership map
pub struct RetryDaemon {
    broker: Arc<dyn Broker>,
    exchange: String,
    ownership: DlqOwnership,
    options: RetryOptions,
}

impl RetryDaemon {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        ownership: DlqOwnership,
        options: RetryOptions,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            ownership,
            options,
        }
    }

    pub fn ownership(&self) -> &DlqOwnership {
        &self.ownership
    }

    /// Drain immediately, then once per poll interval until shutdown.
    ///
    /// A message already pulled when shutdown arrives is republished and
    /// acknowledged (or requeued) before the loop exits.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let owned: Vec<&str> = self
            .ownership
            .queues()
            .iter()
            .map(|q| q.dead_letter_queue.as_str())
            .collect();
        info!(
            owned = ?owned,
            poll_interval_seconds = self.options.poll_interval.as_secs(),
            "Starting retry daemon"
        );

        while !shutdown.is_requested() {
            self.drain_all(Some(&shutdown)).await;

            tokio::select! {
                _ = shutdown.requested() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        info!("Retry daemon stopped");
    }

    /// One drain pass over every owned DLQ
    pub async fn drain_cycle(&self) -> Vec<DrainReport> {
        self.drain_all(None).await
    }

    async fn drain_all(&self, shutdown: Option<&ShutdownSignal>) -> Vec<DrainReport> {
        let mut reports = Vec::with_capacity(self.ownership.len());
        for owned in self.ownership.queues() {
            if shutdown.is_some_and(ShutdownSignal::is_requested) {
                break;
            }
            let report = self.drain_queue(owned, shutdown).await;
            if report.depth > 0 {
                info!(
                    dlq = %report.dead_letter_queue,
                    depth = report.depth,
                    republished = report.republished,
                    failed = report.failed,
                    "Dead letter queue drained"
                );
            }
            reports.push(report);
        }
        reports
    }

    /// Republish at most the messages counted at the start.
    ///
    /// A message the broker refuses (nack or unroutable) is held and the pass
    /// moves on; held messages go back to the DLQ when the pass ends. Any other
    /// failure ends the pass.
    #[instrument(skip(self, shutdown), fields(dlq = %owned.dead_letter_queue))]
    async fn drain_queue(
        &self,
        owned: &OwnedQueue,
        shutdown: Option<&ShutdownSignal>,
    ) -> DrainReport {
        let dlq = owned.dead_letter_queue.as_str();
        let mut report = DrainReport::new(dlq);

        report.depth = match self.broker.queue_depth(dlq).await {
            Ok(depth) => depth,
            Err(e) => {
                error!(error = %e, "Failed to read dead letter queue depth");
                report.failed = 1;
                return report;
            }
        };
        telemetry::update_dead_letter_depth(dlq, report.depth);
        if report.depth == 0 {
            debug!("Dead letter queue empty");
            return report;
        }

        let mut held = Vec::new();
        for _ in 0..report.depth {
            if shutdown.is_some_and(ShutdownSignal::is_requested) {
                debug!("Shutdown requested, leaving the rest for the next run");
                break;
            }

            let delivery =
                match tokio::time::timeout(self.options.consume_timeout, self.broker.get(dlq)).await
                {
                    Ok(Ok(Some(delivery))) => delivery,
                    Ok(Ok(None)) => {
                        debug!("Dead letter queue drained early");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Failed to fetch dead letter");
                        report.failed += 1;
                        break;
                    }
                    Err(_) => {
                        // a fetch cut off here may already hold a message on the channel
                        warn!("No dead letter within consume timeout, resetting channel");
                        if let Err(e) = self.broker.reset_channel().await {
                            error!(error = %e, "Failed to reset broker channel");
                        }
                        held.clear();
                        break;
                    }
                };

            let envelope = DeadLetterEnvelope::from_delivery(&delivery, Some(&owned.primary_queue));
            if !envelope.has_death_metadata() {
                warn!(
                    routing_key = %envelope.original_routing_key,
                    "Dead letter without death metadata, using its own routing key"
                );
            }
            let properties = delivery.properties.without_death_headers();

            if let Err(e) = self
                .broker
                .publish(
                    &self.exchange,
                    &envelope.original_routing_key,
                    &envelope.body,
                    &properties,
                )
                .await
            {
                report.failed += 1;
                telemetry::record_republish_failure(dlq);
                warn!(
                    routing_key = %envelope.original_routing_key,
                    death_count = envelope.death_count,
                    error = %e,
                    "Republish failed, holding dead letter for requeue"
                );
                let message_specific = e.is_message_specific();
                held.push(delivery);
                if message_specific {
                    continue;
                }
                break;
            }

            if let Err(e) = self.broker.ack(&delivery).await {
                // already republished: the copy left in the DLQ is redelivered next cycle
                report.failed += 1;
                error!(
                    routing_key = %envelope.original_routing_key,
                    error = %e,
                    "Failed to acknowledge republished dead letter"
                );
                break;
            }

            report.republished += 1;
            telemetry::record_republished(dlq);
            debug!(
                routing_key = %envelope.original_routing_key,
                original_queue = envelope.original_queue.as_deref().unwrap_or(""),
                reason = envelope.reason.as_deref().unwrap_or(""),
                death_count = envelope.death_count,
                "Dead letter republished"
            );
        }

        // newest first so each requeue lands ahead of the later ones
        for delivery in held.iter().rev() {
            if let Err(e) = self.broker.nack(delivery, true).await {
                // the broker requeues unacknowledged messages when the channel closes
                error!(error = %e, "Failed to requeue dead letter");
            }
        }

        report
    }
}
