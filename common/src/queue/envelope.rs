// Dead letter envelope: everything needed to redeliver, read from the message itself

use super::broker::{DeathRecord, Delivery};

/// A dead-lettered message as the retry daemon sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    pub original_routing_key: String,
    pub original_queue: Option<String>,
    pub reason: Option<String>,
    pub death_count: u64,
    pub body: Vec<u8>,
}

impl DeadLetterEnvelope {
    /// Recover the original routing key and body from death metadata.
    ///
    /// The death record of `primary_queue` wins when present, otherwise the
    /// most recent death. Without any usable record the delivery's own
    /// routing key is used.
    pub fn from_delivery(delivery: &Delivery, primary_queue: Option<&str>) -> Self {
        let record = primary_queue
            .and_then(|queue| delivery.deaths.iter().find(|d| d.queue == queue))
            .or_else(|| delivery.deaths.first());

        let original_routing_key = record
            .and_then(|d| d.routing_keys.first())
            .filter(|key| !key.is_empty())
            .cloned()
            .unwrap_or_else(|| delivery.routing_key.clone());

        Self {
            original_routing_key,
            original_queue: record.map(|d| d.queue.clone()),
            reason: record.map(|d| d.reason.clone()),
            death_count: record.map(|d| d.count).unwrap_or(0),
            body: delivery.body.clone(),
        }
    }

    pub fn has_death_metadata(&self) -> bool {
        self.original_queue.is_some()
    }
}

impl DeathRecord {
    pub fn new(queue: &str, reason: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            reason: reason.to_string(),
            count: 1,
            exchange: exchange.to_string(),
            routing_keys: vec![routing_key.to_string()],
        }
    }
}
