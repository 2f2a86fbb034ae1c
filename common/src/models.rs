use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Trigger Store Models
// ============================================================================

/// ScheduledTask is one pending (or already handled) trigger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ScheduledTask {
    pub id: Uuid,
    /// Selects the scheduler daemon, event builder and routing key
    pub kind: String,
    pub due_at: DateTime<Utc>,
    pub is_processed: bool,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    /// Time left until the task may be processed, `None` once it is due.
    ///
    /// `early_wake` shifts the deadline backwards.
    pub fn time_until_due(
        &self,
        now: DateTime<Utc>,
        early_wake: std::time::Duration,
    ) -> Option<std::time::Duration> {
        let early_wake = chrono::Duration::from_std(early_wake).unwrap_or(chrono::Duration::zero());
        let wake_at = self.due_at - early_wake;
        (wake_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// NewTask is what a domain collaborator hands to the store to schedule work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(kind: impl Into<String>, due_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            due_at,
            payload,
        }
    }
}

// ============================================================================
// Event Models
// ============================================================================

/// OutboundEvent is the (routing key, body) pair an event builder produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// EventEnvelope is the JSON body written for scheduled tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub task_id: Uuid,
    pub kind: String,
    pub due_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn for_task(event_type: impl Into<String>, task: &ScheduledTask) -> Self {
        Self {
            event_type: event_type.into(),
            task_id: task.id,
            kind: task.kind.clone(),
            due_at: task.due_at,
            payload: task.payload.clone(),
        }
    }
}
