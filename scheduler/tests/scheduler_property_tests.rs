// Property-based tests for the scheduler daemon

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::config::Settings;
use common::errors::QueueError;
use common::models::{EventEnvelope, NewTask, ScheduledTask};
use common::queue::{Broker, Delivery, InMemoryBroker, MessageProperties};
use common::scheduler::{RoutingKeyEventBuilder, SchedulerDaemon, SchedulerOptions, Step};
use common::shutdown;
use common::store::{InMemoryTaskStore, TaskStore};
use common::topology::Topology;
use mockall::mock;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mock! {
    pub Broker {}

    #[async_trait]
    impl Broker for Broker {
        async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError>;
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: &[u8],
            properties: &MessageProperties,
        ) -> Result<(), QueueError>;
        async fn queue_depth(&self, queue: &str) -> Result<u32, QueueError>;
        async fn get(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;
        async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
        async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
        async fn reset_channel(&self) -> Result<(), QueueError>;
    }
}

const MAX_WAKE: Duration = Duration::from_secs(900);

struct Harness {
    store: InMemoryTaskStore,
    broker: InMemoryBroker,
    topology: Topology,
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn harness() -> Harness {
    let topology = Settings::default().topology;
    let broker = InMemoryBroker::new();
    broker.declare_topology(&topology).await.unwrap();
    Harness {
        store: InMemoryTaskStore::new(),
        broker,
        topology,
    }
}

fn options(max_wake_interval: Duration) -> SchedulerOptions {
    SchedulerOptions {
        max_wake_interval,
        early_wake_buffer: Duration::ZERO,
        error_backoff: Duration::from_millis(10),
    }
}

fn daemon_with(
    h: &Harness,
    broker: Arc<dyn Broker>,
    max_wake_interval: Duration,
) -> SchedulerDaemon {
    SchedulerDaemon::new(
        "reminder",
        Arc::new(h.store.clone()),
        Box::new(h.store.changes().subscribe()),
        broker,
        h.topology.exchange.clone(),
        Arc::new(RoutingKeyEventBuilder::new("reminder.due")),
        options(max_wake_interval),
    )
}

fn daemon(h: &Harness) -> SchedulerDaemon {
    daemon_with(h, Arc::new(h.broker.clone()), MAX_WAKE)
}

fn schedule(h: &Harness, kind: &str, offset_seconds: i64) -> ScheduledTask {
    h.store
        .schedule(NewTask::new(
            kind,
            Utc::now() + ChronoDuration::seconds(offset_seconds),
            serde_json::json!({"offset": offset_seconds}),
        ))
        .unwrap()
}

/// Run iterations until the daemon stops publishing, return how many it published
async fn drain(daemon: &SchedulerDaemon) -> usize {
    let mut published = 0;
    while let Ok(Step::Published(_)) = daemon.process_next().await {
        published += 1;
    }
    published
}

fn published_envelopes(h: &Harness) -> Vec<EventEnvelope> {
    h.broker
        .peek("reminders")
        .iter()
        .map(|d| serde_json::from_slice(&d.body).unwrap())
        .collect()
}

/// **Property: Single processing**
///
/// *For any* set of past-due tasks, one wake cycle publishes exactly one event
/// per task and marks each processed; running again publishes nothing more.
#[test]
fn property_single_processing() {
    proptest!(ProptestConfig::with_cases(50), |(
        past in prop::collection::vec(1i64..100_000, 1..15),
        future in prop::collection::vec(1_000i64..100_000, 0..5)
    )| {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            let due: Vec<_> = past.iter().map(|s| schedule(&h, "reminder", -s)).collect();
            let later: Vec<_> = future.iter().map(|s| schedule(&h, "reminder", *s)).collect();
            let d = daemon(&h);

            prop_assert_eq!(drain(&d).await, due.len());
            prop_assert_eq!(h.broker.depth("reminders"), due.len());
            for task in &due {
                prop_assert!(h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
            }
            for task in &later {
                prop_assert!(!h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
            }

            prop_assert_eq!(drain(&d).await, 0);
            prop_assert_eq!(h.broker.depth("reminders"), due.len());

            let ids: HashSet<_> = published_envelopes(&h).iter().map(|e| e.task_id).collect();
            prop_assert_eq!(ids.len(), due.len());
            Ok(())
        });
        result?;
    });
}

/// **Property: FIFO by due time**
///
/// *For any* set of due tasks, events are published in non-decreasing `due_at` order.
#[test]
fn property_due_time_order() {
    proptest!(ProptestConfig::with_cases(50), |(
        past in prop::collection::vec(1i64..10_000, 2..20)
    )| {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            for seconds in &past {
                schedule(&h, "reminder", -seconds);
            }
            drain(&daemon(&h)).await;

            let envelopes = published_envelopes(&h);
            prop_assert_eq!(envelopes.len(), past.len());
            for pair in envelopes.windows(2) {
                prop_assert!(pair[0].due_at <= pair[1].due_at);
            }
            Ok(())
        });
        result?;
    });
}

/// **Property: No premature processing**
///
/// *For any* task due later than the maximum wake interval, an iteration
/// publishes nothing and reports a wait longer than that interval, which the
/// loop caps to the interval.
#[test]
fn property_no_premature_processing() {
    proptest!(ProptestConfig::with_cases(50), |(
        extra in 1i64..1_000_000
    )| {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            let task = schedule(&h, "reminder", MAX_WAKE.as_secs() as i64 + extra);
            let d = daemon(&h);

            match d.process_next().await.unwrap() {
                Step::NotDue(until) => prop_assert!(until > MAX_WAKE),
                other => prop_assert!(false, "unexpected step {:?}", other),
            }
            prop_assert_eq!(h.broker.depth("reminders"), 0);
            prop_assert!(!h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
            Ok(())
        });
        result?;
    });
}

/// **Property: Crash safety**
///
/// *For any* batch of due tasks where a previous process claimed one and died
/// before committing, the restarted daemon processes every task exactly once.
#[test]
fn property_crash_before_commit_processes_exactly_once() {
    proptest!(ProptestConfig::with_cases(50), |(
        past in prop::collection::vec(1i64..10_000, 1..10),
        crashed_index in any::<prop::sample::Index>()
    )| {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            let tasks: Vec<_> = past.iter().map(|s| schedule(&h, "reminder", -s)).collect();
            let crashed = crashed_index.get(&tasks);

            // the dead process held the row lock; its transaction rolls back on drop
            let claim = h.store.claim(crashed.id).await.unwrap().unwrap();
            drop(claim);

            prop_assert_eq!(drain(&daemon(&h)).await, tasks.len());
            let envelopes = published_envelopes(&h);
            let crashed_events = envelopes.iter().filter(|e| e.task_id == crashed.id).count();
            prop_assert_eq!(crashed_events, 1);
            prop_assert_eq!(envelopes.len(), tasks.len());
            Ok(())
        });
        result?;
    });
}

/// **Property: Kinds are isolated**
///
/// *For any* mix of task kinds, a daemon only publishes tasks of its own kind.
#[test]
fn property_other_kinds_untouched() {
    proptest!(ProptestConfig::with_cases(50), |(
        own in 0usize..8,
        foreign in 1usize..8
    )| {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            for i in 0..own {
                schedule(&h, "reminder", -(i as i64) - 1);
            }
            let others: Vec<_> = (0..foreign)
                .map(|i| schedule(&h, "status-transition", -(i as i64) - 1))
                .collect();

            prop_assert_eq!(drain(&daemon(&h)).await, own);
            prop_assert_eq!(h.broker.depth("status-transitions"), 0);
            for task in &others {
                prop_assert!(!h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
            }
            Ok(())
        });
        result?;
    });
}

#[tokio::test]
async fn test_publish_uses_configured_exchange_and_routing_key() {
    let h = harness().await;
    let task = schedule(&h, "reminder", -300);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    let mut broker = MockBroker::new();
    broker
        .expect_publish()
        .times(1)
        .returning(move |exchange, routing_key, body, properties| {
            recorded.lock().unwrap().push((
                exchange.to_string(),
                routing_key.to_string(),
                body.to_vec(),
                properties.message_id.clone(),
            ));
            Ok(())
        });

    let d = daemon_with(&h, Arc::new(broker), MAX_WAKE);
    assert_eq!(d.process_next().await.unwrap(), Step::Published(task.id));

    let calls = calls.lock().unwrap();
    let (exchange, routing_key, body, message_id) = &calls[0];
    assert_eq!(exchange, "events");
    assert_eq!(routing_key, "reminder.due");
    assert_eq!(message_id.as_deref(), Some(task.id.to_string().as_str()));
    let envelope: EventEnvelope = serde_json::from_slice(body).unwrap();
    assert_eq!(envelope.task_id, task.id);
}

#[tokio::test]
async fn test_unconfirmed_publish_leaves_task_pending() {
    let h = harness().await;
    let task = schedule(&h, "reminder", -1);

    let mut broker = MockBroker::new();
    broker
        .expect_publish()
        .times(2)
        .returning(|_, routing_key, _, _| Err(QueueError::PublishNacked(routing_key.to_string())));

    let d = daemon_with(&h, Arc::new(broker), MAX_WAKE);
    for _ in 0..2 {
        assert!(d.process_next().await.is_err());
        assert!(!h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
    }
}

#[tokio::test]
async fn test_reminder_due_five_minutes_ago_is_delivered_within_two_seconds() {
    let h = harness().await;
    let task = schedule(&h, "reminder", -300);

    let (trigger, signal) = shutdown::channel();
    let handle = tokio::spawn(daemon(&h).run(signal));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline
        && !h.store.find_by_id(task.id).unwrap().unwrap().is_processed
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(h.store.find_by_id(task.id).unwrap().unwrap().is_processed);
    let messages = h.broker.peek("reminders");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].routing_key, "reminder.due");

    trigger.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_run_respects_max_wake_interval_without_notifications() {
    let h = harness().await;

    // a listener nobody notifies: only the wake interval can bring the daemon back
    let silent = common::notify::ChangeHub::new();
    let d = SchedulerDaemon::new(
        "reminder",
        Arc::new(h.store.clone()),
        Box::new(silent.subscribe()),
        Arc::new(h.broker.clone()),
        h.topology.exchange.clone(),
        Arc::new(RoutingKeyEventBuilder::new("reminder.due")),
        options(Duration::from_millis(100)),
    );
    let task = schedule(&h, "reminder", 3_600);
    let (trigger, signal) = shutdown::channel();
    let handle = tokio::spawn(d.run(signal));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.broker.depth("reminders"), 0);

    // moved into the past without a notification: picked up on the next wake
    h.store
        .reschedule(task.id, Utc::now() - ChronoDuration::seconds(1))
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.broker.depth("reminders") == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.broker.depth("reminders"), 1);

    trigger.trigger();
    handle.await.unwrap();
}
