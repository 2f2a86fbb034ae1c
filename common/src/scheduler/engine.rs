// Scheduler daemon: wake when the next task of a kind is due and publish it

use crate::config::SchedulerConfig;
use crate::errors::{DaemonError, TopologyError};
use crate::models::ScheduledTask;
use crate::notify::{ChangeListener, Wake};
use crate::queue::Broker;
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::scheduler::event::EventBuilder;
use crate::shutdown::ShutdownSignal;
use crate::store::TaskStore;
use crate::telemetry;
use crate::topology::Topology;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Timing parameters of one scheduler daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Upper bound on any single wait, covers dropped notifications
    pub max_wake_interval: Duration,
    /// Treat tasks as due this much before `due_at`
    pub early_wake_buffer: Duration,
    /// First pause after a failed iteration, grows on repeated failures
    pub error_backoff: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_wake_interval: Duration::from_secs(900),
            early_wake_buffer: Duration::ZERO,
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_wake_interval: config.max_wake_interval(),
            early_wake_buffer: config.early_wake_buffer(),
            error_backoff: config.error_backoff(),
        }
    }
}

/// What one iteration of the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Event confirmed by the broker and task committed as processed
    Published(Uuid),
    /// The task was processed, locked or moved by someone else in the meantime
    Skipped(Uuid),
    /// Next task becomes due after this long
    NotDue(Duration),
    /// No unprocessed task of this kind
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Woken,
    Shutdown,
}

/// Generic scheduler loop for one task kind
pub struct SchedulerDaemon {
    core: Dispatcher,
    listener: Box<dyn ChangeListener>,
}

/// Everything but the listener, shared by reference across the loop's awaits
struct Dispatcher {
    kind: String,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    exchange: String,
    builder: Arc<dyn EventBuilder>,
    options: SchedulerOptions,
    backoff: ExponentialBackoff,
}

impl SchedulerDaemon {
    pub fn new(
        kind: impl Into<String>,
        store: Arc<dyn TaskStore>,
        listener: Box<dyn ChangeListener>,
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        builder: Arc<dyn EventBuilder>,
        options: SchedulerOptions,
    ) -> Self {
        let backoff = ExponentialBackoff::new(options.error_backoff, options.max_wake_interval);
        Self {
            core: Dispatcher {
                kind: kind.into(),
                store,
                broker,
                exchange: exchange.into(),
                builder,
                options,
                backoff,
            },
            listener,
        }
    }

    pub fn kind(&self) -> &str {
        &self.core.kind
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.core.options
    }

    /// Fail fast when the builder's routing key reaches no primary queue
    pub fn validate(&self, topology: &Topology) -> Result<(), DaemonError> {
        let core = &self.core;
        if core.kind.trim().is_empty() {
            return Err(TopologyError::BlankName("scheduler kind").into());
        }
        if core.exchange != topology.exchange {
            return Err(TopologyError::UnroutableKey(format!(
                "daemon '{}' publishes to exchange '{}', topology declares '{}'",
                core.kind, core.exchange, topology.exchange
            ))
            .into());
        }
        if let Some(routing_key) = core.builder.routing_key() {
            topology.ensure_routable(routing_key)?;
        }
        Ok(())
    }

    /// Run until shutdown is requested.
    ///
    /// Transient errors are logged and retried after a growing pause. A task
    /// already claimed when shutdown arrives is finished before returning.
    #[instrument(skip_all, fields(kind = %self.core.kind))]
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let Self { core, mut listener } = self;
        let mut consecutive_failures: u32 = 0;

        info!(
            max_wake_interval_seconds = core.options.max_wake_interval.as_secs(),
            early_wake_buffer_seconds = core.options.early_wake_buffer.as_secs(),
            "Starting scheduler daemon"
        );

        while !shutdown.is_requested() {
            let pause = match core.process_next().await {
                Ok(Step::Published(_)) => {
                    consecutive_failures = 0;
                    continue;
                }
                // the holder's commit notifies, so this rarely waits the full backoff
                Ok(Step::Skipped(_)) => core.options.error_backoff,
                Ok(Step::NotDue(until)) => {
                    consecutive_failures = 0;
                    until.min(core.options.max_wake_interval)
                }
                Ok(Step::Idle) => {
                    consecutive_failures = 0;
                    core.options.max_wake_interval
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = core.backoff.next_delay(consecutive_failures);
                    error!(
                        error = %e,
                        consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Scheduler iteration failed"
                    );
                    delay
                }
            };

            if core.wait(listener.as_mut(), pause, &mut shutdown).await == WaitOutcome::Shutdown {
                break;
            }
        }

        info!("Scheduler daemon stopped");
    }

    /// One iteration without the wait: look at the earliest task and publish it if due
    pub async fn process_next(&self) -> Result<Step, DaemonError> {
        self.core.process_next().await
    }
}

impl Dispatcher {
    #[instrument(skip(self), fields(kind = %self.kind))]
    async fn process_next(&self) -> Result<Step, DaemonError> {
        let Some(task) = self.store.next_pending(&self.kind).await? else {
            debug!("No pending tasks");
            return Ok(Step::Idle);
        };

        match task.time_until_due(Utc::now(), self.options.early_wake_buffer) {
            Some(until) => {
                debug!(
                    task_id = %task.id,
                    due_at = %task.due_at,
                    wait_ms = until.as_millis() as u64,
                    "Next task not due yet"
                );
                Ok(Step::NotDue(until))
            }
            None => self.process_due(task.id).await,
        }
    }

    /// Claim, build, publish, then commit. Any failure before the commit rolls back.
    #[instrument(skip(self), fields(kind = %self.kind))]
    async fn process_due(&self, task_id: Uuid) -> Result<Step, DaemonError> {
        let Some(claim) = self.store.claim(task_id).await? else {
            debug!(%task_id, "Task already processed or locked elsewhere");
            return Ok(Step::Skipped(task_id));
        };

        // The locked row is authoritative: it may have been rescheduled since the query
        let task: ScheduledTask = claim.task().clone();
        if task
            .time_until_due(Utc::now(), self.options.early_wake_buffer)
            .is_some()
        {
            debug!(%task_id, due_at = %task.due_at, "Task was rescheduled, releasing claim");
            claim.abandon().await?;
            return Ok(Step::Skipped(task_id));
        }

        let event = match self.builder.build(&task) {
            Ok(event) => event,
            Err(e) => {
                if let Err(rollback) = claim.abandon().await {
                    warn!(%task_id, error = %rollback, "Rollback after build failure failed");
                }
                return Err(e.into());
            }
        };
        let properties = self.builder.properties(&task);

        if let Err(e) = self
            .broker
            .publish(&self.exchange, &event.routing_key, &event.body, &properties)
            .await
        {
            telemetry::record_publish_failure(&self.kind);
            if let Err(rollback) = claim.abandon().await {
                warn!(%task_id, error = %rollback, "Rollback after publish failure failed");
            }
            warn!(
                %task_id,
                routing_key = %event.routing_key,
                error = %e,
                "Publish failed, task stays eligible"
            );
            return Err(e.into());
        }

        if let Err(e) = claim.complete().await {
            // The broker already holds the event; the task will be published again
            error!(
                %task_id,
                routing_key = %event.routing_key,
                error = %e,
                "Commit failed after confirmed publish"
            );
            return Err(e.into());
        }

        let latency = (Utc::now() - task.due_at).num_milliseconds().max(0) as f64 / 1000.0;
        telemetry::record_event_published(&self.kind, latency);
        info!(
            %task_id,
            routing_key = %event.routing_key,
            latency_seconds = latency,
            "Task published and marked processed"
        );

        Ok(Step::Published(task_id))
    }

    /// Wait for a change notification, the timeout or shutdown, whichever comes first
    async fn wait(
        &self,
        listener: &mut dyn ChangeListener,
        timeout: Duration,
        shutdown: &mut ShutdownSignal,
    ) -> WaitOutcome {
        let result = tokio::select! {
            _ = shutdown.requested() => return WaitOutcome::Shutdown,
            result = listener.wait_for_change(timeout) => result,
        };

        match result {
            Ok(Wake::Notified) => {
                debug!("Woken by change notification");
                WaitOutcome::Woken
            }
            Ok(Wake::TimedOut) => WaitOutcome::Woken,
            Err(e) => {
                // Listener broken: fall back to plain sleeping so the loop does not spin
                warn!(error = %e, "Change listener failed, sleeping instead");
                tokio::select! {
                    _ = shutdown.requested() => WaitOutcome::Shutdown,
                    _ = tokio::time::sleep(self.options.error_backoff.min(timeout)) => WaitOutcome::Woken,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{EventEnvelope, NewTask};
    use crate::queue::InMemoryBroker;
    use crate::scheduler::RoutingKeyEventBuilder;
    use crate::shutdown;
    use crate::store::InMemoryTaskStore;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        store: InMemoryTaskStore,
        broker: InMemoryBroker,
        topology: Topology,
    }

    async fn fixture() -> Fixture {
        let topology = Settings::default().topology;
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology).await.unwrap();
        Fixture {
            store: InMemoryTaskStore::new(),
            broker,
            topology,
        }
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            max_wake_interval: Duration::from_secs(60),
            early_wake_buffer: Duration::ZERO,
            error_backoff: Duration::from_millis(10),
        }
    }

    fn daemon(f: &Fixture, options: SchedulerOptions) -> SchedulerDaemon {
        SchedulerDaemon::new(
            "reminder",
            Arc::new(f.store.clone()),
            Box::new(f.store.changes().subscribe()),
            Arc::new(f.broker.clone()),
            f.topology.exchange.clone(),
            Arc::new(RoutingKeyEventBuilder::new("reminder.due")),
            options,
        )
    }

    #[tokio::test]
    async fn test_due_task_is_published_once() {
        let f = fixture().await;
        let task = f
            .store
            .schedule(NewTask::new(
                "reminder",
                Utc::now() - ChronoDuration::minutes(5),
                serde_json::json!({"reminder_id": 1}),
            ))
            .unwrap();
        let d = daemon(&f, options());

        assert_eq!(d.process_next().await.unwrap(), Step::Published(task.id));
        assert_eq!(d.process_next().await.unwrap(), Step::Idle);

        let messages = f.broker.peek("reminders");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routing_key, "reminder.due");
        let envelope: EventEnvelope = serde_json::from_slice(&messages[0].body).unwrap();
        assert_eq!(envelope.task_id, task.id);
        assert!(f.store.find_by_id(task.id).unwrap().unwrap().is_processed);
    }

    #[tokio::test]
    async fn test_future_task_is_not_processed() {
        let f = fixture().await;
        f.store
            .schedule(NewTask::new(
                "reminder",
                Utc::now() + ChronoDuration::hours(2),
                serde_json::json!({}),
            ))
            .unwrap();
        let d = daemon(&f, options());

        match d.process_next().await.unwrap() {
            Step::NotDue(until) => assert!(until > Duration::from_secs(3600)),
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(f.broker.depth("reminders"), 0);
    }

    #[tokio::test]
    async fn test_early_wake_buffer_pulls_deadline_forward() {
        let f = fixture().await;
        let task = f
            .store
            .schedule(NewTask::new(
                "reminder",
                Utc::now() + ChronoDuration::seconds(30),
                serde_json::json!({}),
            ))
            .unwrap();
        let mut opts = options();
        opts.early_wake_buffer = Duration::from_secs(60);
        let d = daemon(&f, opts);

        assert_eq!(d.process_next().await.unwrap(), Step::Published(task.id));
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back() {
        let f = fixture().await;
        let task = f
            .store
            .schedule(NewTask::new(
                "reminder",
                Utc::now() - ChronoDuration::seconds(1),
                serde_json::json!({}),
            ))
            .unwrap();
        let d = daemon(&f, options());

        f.broker.fail_next_publishes(1);
        assert!(matches!(
            d.process_next().await,
            Err(DaemonError::Queue(_))
        ));
        assert!(!f.store.find_by_id(task.id).unwrap().unwrap().is_processed);
        assert_eq!(f.broker.depth("reminders"), 0);

        assert_eq!(d.process_next().await.unwrap(), Step::Published(task.id));
        assert_eq!(f.broker.depth("reminders"), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_task_eligible() {
        let f = fixture().await;
        let task = f
            .store
            .schedule(NewTask::new("reminder", Utc::now(), serde_json::json!({})))
            .unwrap();
        let d = daemon(&f, options());

        f.store.set_failing_commits(true);
        assert!(matches!(
            d.process_next().await,
            Err(DaemonError::Database(_))
        ));
        f.store.set_failing_commits(false);
        assert!(!f.store.find_by_id(task.id).unwrap().unwrap().is_processed);

        // at-least-once: the retried commit publishes a second copy
        assert_eq!(d.process_next().await.unwrap(), Step::Published(task.id));
        assert_eq!(f.broker.depth("reminders"), 2);
    }

    #[tokio::test]
    async fn test_store_outage_is_reported() {
        let f = fixture().await;
        let d = daemon(&f, options());
        f.store.set_unavailable(true);
        assert!(matches!(
            d.process_next().await,
            Err(DaemonError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_tasks_of_other_kinds_are_ignored() {
        let f = fixture().await;
        f.store
            .schedule(NewTask::new(
                "status-transition",
                Utc::now() - ChronoDuration::minutes(1),
                serde_json::json!({}),
            ))
            .unwrap();
        let d = daemon(&f, options());
        assert_eq!(d.process_next().await.unwrap(), Step::Idle);
    }

    #[tokio::test]
    async fn test_validate_rejects_unroutable_key() {
        let f = fixture().await;
        let d = SchedulerDaemon::new(
            "invoice",
            Arc::new(f.store.clone()),
            Box::new(f.store.changes().subscribe()),
            Arc::new(f.broker.clone()),
            f.topology.exchange.clone(),
            Arc::new(RoutingKeyEventBuilder::new("invoice.due")),
            options(),
        );
        assert!(matches!(
            d.validate(&f.topology),
            Err(DaemonError::Topology(TopologyError::UnroutableKey(_)))
        ));
        assert!(daemon(&f, options()).validate(&f.topology).is_ok());
    }

    #[tokio::test]
    async fn test_run_wakes_on_insert_and_stops_on_shutdown() {
        let f = fixture().await;
        let (trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(daemon(&f, options()).run(signal));

        // Idle daemon waits on the listener, the insert notifies it
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = f
            .store
            .schedule(NewTask::new("reminder", Utc::now(), serde_json::json!({})))
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.broker.depth("reminders") == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.broker.depth("reminders"), 1);
        assert!(f.store.find_by_id(task.id).unwrap().unwrap().is_processed);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_recovers_after_broker_outage() {
        let f = fixture().await;
        f.store
            .schedule(NewTask::new("reminder", Utc::now(), serde_json::json!({})))
            .unwrap();
        f.broker.fail_next_publishes(3);

        let (trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(daemon(&f, options()).run(signal));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while f.broker.depth("reminders") == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.broker.depth("reminders"), 1);

        trigger.trigger();
        handle.await.unwrap();
    }
}
