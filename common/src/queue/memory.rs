// In-memory broker modelling the AMQP semantics the daemons rely on

use super::broker::{Broker, DeathRecord, Delivery, MessageProperties};
use crate::errors::QueueError;
use crate::topology::{QueueArguments, Topology};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    deaths: Vec<DeathRecord>,
    redelivered: bool,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    arguments: Option<QueueArguments>,
}

#[derive(Debug, Default)]
struct State {
    topology: Option<Topology>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    fail_next_publishes: usize,
    publishes_before_outage: Option<usize>,
    failing_routing_keys: Vec<String>,
    published: u64,
    get_delay: Option<Duration>,
}

/// Broker kept in process memory.
///
/// Implements topic routing on the primary exchange, direct routing on the
/// dead letter exchange, the default exchange (routing key = queue name),
/// per-queue TTL expiry and rejection dead-lettering with `x-death` style
/// records, and unacknowledged-message tracking.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Connection("broker state poisoned".to_string()))
    }

    /// Make the next `n` publishes fail as if the broker were unreachable
    pub fn fail_next_publishes(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_publishes = n;
        }
    }

    /// Let `successes` more publishes through, then fail every publish as if
    /// the broker were unreachable until cleared
    pub fn fail_publishes_after(&self, successes: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.publishes_before_outage = Some(successes);
        }
    }

    /// Reject every publish with this routing key until cleared
    pub fn fail_publishes_with_key(&self, routing_key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_routing_keys.push(routing_key.to_string());
        }
    }

    pub fn clear_publish_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_publishes = 0;
            state.publishes_before_outage = None;
            state.failing_routing_keys.clear();
        }
    }

    /// Hold every `get` for `delay` after the message is taken, as a slow broker would
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.state.lock() {
            state.get_delay = delay;
        }
    }

    /// Number of successfully routed publishes so far
    pub fn published_count(&self) -> u64 {
        self.state.lock().map(|s| s.published).unwrap_or(0)
    }

    /// Ready messages in a queue (after TTL expiry), 0 for unknown queues
    pub fn depth(&self, queue: &str) -> usize {
        match self.state.lock() {
            Ok(mut state) => {
                state.expire(queue);
                state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }

    /// Snapshot of the ready messages of a queue without consuming them
    pub fn peek(&self, queue: &str) -> Vec<Delivery> {
        match self.state.lock() {
            Ok(mut state) => {
                state.expire(queue);
                state
                    .queues
                    .get(queue)
                    .map(|q| {
                        q.ready
                            .iter()
                            .map(|m| m.to_delivery(0, queue))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Place a message directly into a queue, as the broker would when dead-lettering
    pub fn enqueue(
        &self,
        queue: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
        deaths: Vec<DeathRecord>,
    ) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        target.ready.push_back(StoredMessage {
            exchange: String::new(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties,
            deaths,
            redelivered: false,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64, queue: &str) -> Delivery {
        Delivery {
            delivery_tag,
            queue: queue.to_string(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            body: self.body.clone(),
            properties: self.properties.clone(),
            deaths: self.deaths.clone(),
        }
    }

    fn expired(&self, ttl: Option<u32>, now: Instant) -> bool {
        match ttl {
            Some(ttl) => now.duration_since(self.enqueued_at) >= Duration::from_millis(ttl.into()),
            None => false,
        }
    }
}

impl State {
    fn topology(&self) -> Result<&Topology, QueueError> {
        self.topology
            .as_ref()
            .ok_or_else(|| QueueError::Channel("topology not declared".to_string()))
    }

    /// Target queues for a publish, following the exchange type
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, QueueError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let topology = self.topology()?;
        if exchange == topology.exchange {
            Ok(topology
                .route(routing_key)
                .map(|b| b.queue.clone())
                .collect())
        } else if exchange == topology.dead_letter_exchange {
            Ok(topology
                .bindings
                .iter()
                .filter(|b| b.dead_letter_queue == routing_key)
                .map(|b| b.dead_letter_queue.clone())
                .collect())
        } else {
            Err(QueueError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )))
        }
    }

    fn deliver(&mut self, queues: &[String], message: StoredMessage) {
        for queue in queues {
            if let Some(q) = self.queues.get_mut(queue) {
                let mut copy = message.clone();
                copy.enqueued_at = Instant::now();
                q.ready.push_back(copy);
            }
        }
    }

    /// Move a message to the queue's dead letter exchange, recording the death
    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage, reason: &str) {
        let Some(arguments) = self.queues.get(queue).and_then(|q| q.arguments.clone()) else {
            // no DLX configured: the broker discards the message
            return;
        };

        match message
            .deaths
            .iter()
            .position(|d| d.queue == queue && d.reason == reason)
        {
            Some(index) => {
                let mut record = message.deaths.remove(index);
                record.count += 1;
                message.deaths.insert(0, record);
            }
            None => message.deaths.insert(
                0,
                DeathRecord::new(queue, reason, &message.exchange, &message.routing_key),
            ),
        }

        message.exchange = arguments.dead_letter_exchange.clone();
        message.routing_key = arguments.dead_letter_routing_key.clone();
        message.redelivered = false;

        if let Ok(targets) = self.route(&arguments.dead_letter_exchange, &message.routing_key) {
            self.deliver(&targets, message);
        }
    }

    /// Dead-letter messages at the head of the queue whose TTL elapsed
    fn expire(&mut self, queue: &str) {
        let now = Instant::now();
        let mut expired = Vec::new();
        if let Some(q) = self.queues.get_mut(queue) {
            let ttl = q.arguments.as_ref().and_then(|a| a.message_ttl_ms);
            while q.ready.front().is_some_and(|m| m.expired(ttl, now)) {
                if let Some(message) = q.ready.pop_front() {
                    expired.push(message);
                }
            }
        }
        for message in expired {
            self.dead_letter(queue, message, "expired");
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError> {
        let mut state = self.state()?;
        for binding in &topology.bindings {
            state
                .queues
                .entry(binding.dead_letter_queue.clone())
                .or_default();
            let primary = state.queues.entry(binding.queue.clone()).or_default();
            primary.arguments = Some(binding.arguments(&topology.dead_letter_exchange));
        }
        state.topology = Some(topology.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), QueueError> {
        let mut state = self.state()?;

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(QueueError::Connection("broker unavailable".to_string()));
        }
        match state.publishes_before_outage {
            Some(0) => return Err(QueueError::Connection("broker unavailable".to_string())),
            Some(n) => state.publishes_before_outage = Some(n - 1),
            None => {}
        }
        if state.failing_routing_keys.iter().any(|k| k == routing_key) {
            return Err(QueueError::PublishNacked(routing_key.to_string()));
        }

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            return Err(QueueError::Unroutable(format!("312 NO_ROUTE {}", routing_key)));
        }

        state.deliver(
            &targets,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
                deaths: Vec::new(),
                redelivered: false,
                enqueued_at: Instant::now(),
            },
        );
        state.published += 1;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, QueueError> {
        let mut state = self.state()?;
        state.expire(queue);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let (delivery, delay) = {
            let mut state = self.state()?;
            state.expire(queue);
            state.next_tag += 1;
            let tag = state.next_tag;
            let delay = state.get_delay;

            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
            let delivery = q.ready.pop_front().map(|message| {
                let delivery = message.to_delivery(tag, queue);
                q.unacked.insert(tag, message);
                delivery
            });
            (delivery, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(delivery)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state
            .queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.delivery_tag))
            .map(|_| ())
            .ok_or_else(|| {
                QueueError::AckFailed(format!("unknown delivery tag {}", delivery.delivery_tag))
            })
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let message = state
            .queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.delivery_tag))
            .ok_or_else(|| {
                QueueError::AckFailed(format!("unknown delivery tag {}", delivery.delivery_tag))
            })?;

        if requeue {
            let mut message = message;
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&delivery.queue) {
                q.ready.push_front(message);
            }
        } else {
            state.dead_letter(&delivery.queue, message, "rejected");
        }
        Ok(())
    }

    async fn reset_channel(&self) -> Result<(), QueueError> {
        let mut state = self.state()?;
        for q in state.queues.values_mut() {
            let mut tags: Vec<u64> = q.unacked.keys().copied().collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(mut message) = q.unacked.remove(&tag) {
                    message.redelivered = true;
                    q.ready.push_front(message);
                }
            }
        }
        Ok(())
    }
}
