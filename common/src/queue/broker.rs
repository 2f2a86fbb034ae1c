// Broker trait and the message shapes exchanged across it

use crate::errors::QueueError;
use crate::topology::Topology;
use async_trait::async_trait;
use lapin::types::FieldTable;
use lapin::BasicProperties;
use std::collections::BTreeMap;

/// Headers the broker writes when dead-lettering; never forwarded on republish
pub const DEATH_HEADERS: &[&str] = &[
    "x-death",
    "x-first-death-queue",
    "x-first-death-reason",
    "x-first-death-exchange",
    "x-last-death-queue",
    "x-last-death-reason",
    "x-last-death-exchange",
];

/// Message properties carried across publish and republish.
///
/// String headers are modelled in `headers`. Whatever else the original
/// publisher set (correlation id, type, timestamp, non-string headers) rides
/// along in `amqp` and is forwarded as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub amqp: Option<BasicProperties>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Copy with broker death bookkeeping removed
    pub fn without_death_headers(&self) -> Self {
        let mut cleaned = self.clone();
        cleaned
            .headers
            .retain(|name, _| !DEATH_HEADERS.contains(&name.as_str()));
        cleaned.amqp = cleaned.amqp.take().map(|amqp| {
            let headers = amqp.headers().clone();
            match headers {
                Some(table) => {
                    let mut kept = FieldTable::default();
                    for (name, value) in table.inner() {
                        if !DEATH_HEADERS.contains(&name.as_str()) {
                            kept.insert(name.clone(), value.clone());
                        }
                    }
                    amqp.with_headers(kept)
                }
                None => amqp,
            }
        });
        cleaned
    }
}

/// One entry of the broker's `x-death` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub count: u64,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

/// A message pulled from a queue and not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Death history, most recent first
    pub deaths: Vec<DeathRecord>,
}

/// The broker operations both daemons need.
///
/// `publish` resolves only once the broker confirmed the message; an `Ok`
/// means it is durably queued on at least one queue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently declare exchanges, queues and bindings
    async fn declare_topology(&self, topology: &Topology) -> Result<(), QueueError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), QueueError>;

    /// Passive message count of a queue (ready messages only)
    async fn queue_depth(&self, queue: &str) -> Result<u32, QueueError>;

    /// Pull one message without auto-ack
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Throw away the current channel. Every delivery it left unacknowledged
    /// goes back to its queue and its tag becomes invalid.
    async fn reset_channel(&self) -> Result<(), QueueError>;
}
