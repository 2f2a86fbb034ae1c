// Broker topology: primary queues, their dead letter queues and routing

use crate::errors::TopologyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static binding of one primary queue to its single dead letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub dead_letter_queue: String,
    /// Topic patterns binding the queue to the primary exchange
    pub routing_keys: Vec<String>,
    /// Per-queue message TTL. `None` or zero disables expiry-based dead-lettering.
    #[serde(default)]
    pub message_ttl_ms: Option<u32>,
}

impl QueueBinding {
    /// Effective TTL, treating zero as "no expiry"
    pub fn ttl_ms(&self) -> Option<u32> {
        self.message_ttl_ms.filter(|ttl| *ttl > 0)
    }

    pub fn arguments(&self, dead_letter_exchange: &str) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: dead_letter_exchange.to_string(),
            dead_letter_routing_key: self.dead_letter_queue.clone(),
            message_ttl_ms: self.ttl_ms(),
        }
    }

    pub fn accepts(&self, routing_key: &str) -> bool {
        self.routing_keys
            .iter()
            .any(|pattern| routing_key_matches(pattern, routing_key))
    }
}

/// Declaration arguments of a primary queue.
///
/// Dead letters are re-keyed with the DLQ name so the direct dead letter
/// exchange can only ever deliver them to that one DLQ. The original key is
/// kept by the broker in the death metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
    pub message_ttl_ms: Option<u32>,
}

/// The complete declared topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Topic exchange all scheduler publishes and retry republishes go to
    pub exchange: String,
    /// Direct exchange primary queues dead-letter into
    pub dead_letter_exchange: String,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    /// Check the one-queue-one-DLQ invariant and basic naming rules
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.exchange.trim().is_empty() {
            return Err(TopologyError::BlankName("exchange"));
        }
        if self.dead_letter_exchange.trim().is_empty() {
            return Err(TopologyError::BlankName("dead_letter_exchange"));
        }
        if self.bindings.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut primaries: HashMap<&str, ()> = HashMap::new();
        let mut dlq_owners: HashMap<&str, &str> = HashMap::new();

        for binding in &self.bindings {
            if binding.queue.trim().is_empty() {
                return Err(TopologyError::BlankName("queue"));
            }
            if binding.dead_letter_queue.trim().is_empty() {
                return Err(TopologyError::BlankName("dead_letter_queue"));
            }
            if binding.routing_keys.is_empty()
                || binding.routing_keys.iter().any(|k| k.trim().is_empty())
            {
                return Err(TopologyError::NoRoutingKeys(binding.queue.clone()));
            }
            if primaries.insert(binding.queue.as_str(), ()).is_some() {
                return Err(TopologyError::DuplicateQueue(binding.queue.clone()));
            }
            if let Some(first) =
                dlq_owners.insert(binding.dead_letter_queue.as_str(), binding.queue.as_str())
            {
                return Err(TopologyError::SharedDeadLetterQueue {
                    dlq: binding.dead_letter_queue.clone(),
                    first: first.to_string(),
                    second: binding.queue.clone(),
                });
            }
        }

        if let Some(conflict) = dlq_owners.keys().find(|dlq| primaries.contains_key(*dlq)) {
            return Err(TopologyError::QueueRoleConflict(conflict.to_string()));
        }

        Ok(())
    }

    /// Primary queue bound to the given DLQ
    pub fn binding_for_dlq(&self, dlq: &str) -> Option<&QueueBinding> {
        self.bindings.iter().find(|b| b.dead_letter_queue == dlq)
    }

    pub fn binding_for_queue(&self, queue: &str) -> Option<&QueueBinding> {
        self.bindings.iter().find(|b| b.queue == queue)
    }

    /// Primary queues a message with `routing_key` is delivered to
    pub fn route<'a>(&'a self, routing_key: &'a str) -> impl Iterator<Item = &'a QueueBinding> {
        self.bindings.iter().filter(move |b| b.accepts(routing_key))
    }

    /// Fail when a publish with `routing_key` would be silently dropped
    pub fn ensure_routable(&self, routing_key: &str) -> Result<(), TopologyError> {
        if routing_key.trim().is_empty() {
            return Err(TopologyError::BlankName("routing key"));
        }
        if self.route(routing_key).next().is_none() {
            return Err(TopologyError::UnroutableKey(routing_key.to_string()));
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more words
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // `#` either consumes nothing or one more word
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}
