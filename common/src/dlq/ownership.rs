// Static DLQ ownership: which dead letter queues this process drains

use crate::errors::TopologyError;
use crate::topology::Topology;
use std::collections::HashSet;

/// One drained DLQ and the primary queue its messages came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedQueue {
    pub dead_letter_queue: String,
    pub primary_queue: String,
}

/// Validated `{dlq -> primary queue}` mapping handed to the retry daemon.
///
/// Exactly one deployment may be configured to drain a given DLQ. This map
/// cannot enforce that across processes; it only guarantees the local
/// configuration names each DLQ once and every name exists in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqOwnership {
    queues: Vec<OwnedQueue>,
}

impl DlqOwnership {
    /// Build from the topology; every owned DLQ must be named
    pub fn from_topology(topology: &Topology, owned: &[String]) -> Result<Self, TopologyError> {
        topology.validate()?;

        if owned.is_empty() {
            return Err(TopologyError::NoOwnedQueues);
        }

        let mut seen = HashSet::new();
        let mut queues = Vec::with_capacity(owned.len());
        for dlq in owned {
            if !seen.insert(dlq.as_str()) {
                return Err(TopologyError::DuplicateOwner(dlq.clone()));
            }
            let binding = topology
                .binding_for_dlq(dlq)
                .ok_or_else(|| TopologyError::UnknownDeadLetterQueue(dlq.clone()))?;
            queues.push(OwnedQueue {
                dead_letter_queue: binding.dead_letter_queue.clone(),
                primary_queue: binding.queue.clone(),
            });
        }

        Ok(Self { queues })
    }

    pub fn queues(&self) -> &[OwnedQueue] {
        &self.queues
    }

    pub fn primary_for(&self, dead_letter_queue: &str) -> Option<&str> {
        self.queues
            .iter()
            .find(|q| q.dead_letter_queue == dead_letter_queue)
            .map(|q| q.primary_queue.as_str())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
