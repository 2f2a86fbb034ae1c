// Event builders: turn a due task into the message the scheduler publishes

use crate::errors::EventError;
use crate::models::{EventEnvelope, OutboundEvent, ScheduledTask};
use crate::queue::MessageProperties;

/// Header naming the event category, mirrored from the envelope
pub const EVENT_TYPE_HEADER: &str = "event-type";

/// Builds the (routing key, body) pair for a due task
pub trait EventBuilder: Send + Sync {
    fn build(&self, task: &ScheduledTask) -> Result<OutboundEvent, EventError>;

    /// Routing key published by this builder, when it is fixed.
    ///
    /// The daemon checks a fixed key against the topology before starting.
    fn routing_key(&self) -> Option<&str> {
        None
    }

    fn properties(&self, task: &ScheduledTask) -> MessageProperties {
        MessageProperties::json().with_message_id(task.id.to_string())
    }
}

impl<F> EventBuilder for F
where
    F: Fn(&ScheduledTask) -> Result<OutboundEvent, EventError> + Send + Sync,
{
    fn build(&self, task: &ScheduledTask) -> Result<OutboundEvent, EventError> {
        self(task)
    }
}

/// Publishes an [`EventEnvelope`] JSON body under one fixed routing key
#[derive(Debug, Clone)]
pub struct RoutingKeyEventBuilder {
    routing_key: String,
    event_type: String,
}

impl RoutingKeyEventBuilder {
    /// The event type defaults to the routing key
    pub fn new(routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        Self {
            event_type: routing_key.clone(),
            routing_key,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl EventBuilder for RoutingKeyEventBuilder {
    fn build(&self, task: &ScheduledTask) -> Result<OutboundEvent, EventError> {
        let envelope = EventEnvelope::for_task(&self.event_type, task);
        Ok(OutboundEvent {
            routing_key: self.routing_key.clone(),
            body: serde_json::to_vec(&envelope)?,
        })
    }

    fn routing_key(&self) -> Option<&str> {
        Some(&self.routing_key)
    }

    fn properties(&self, task: &ScheduledTask) -> MessageProperties {
        MessageProperties::json()
            .with_message_id(task.id.to_string())
            .with_header(EVENT_TYPE_HEADER, self.event_type.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn task() -> ScheduledTask {
        ScheduledTask {
            id: Uuid::new_v4(),
            kind: "reminder".to_string(),
            due_at: Utc::now(),
            is_processed: false,
            payload: serde_json::json!({"reminder_id": 7}),
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn test_routing_key_builder_writes_envelope() {
        let builder = RoutingKeyEventBuilder::new("reminder.due");
        let task = task();
        let event = builder.build(&task).unwrap();

        assert_eq!(event.routing_key, "reminder.due");
        let envelope: EventEnvelope = serde_json::from_slice(&event.body).unwrap();
        assert_eq!(envelope.event_type, "reminder.due");
        assert_eq!(envelope.task_id, task.id);
        assert_eq!(envelope.payload, task.payload);
    }

    #[test]
    fn test_properties_carry_task_id_and_event_type() {
        let builder = RoutingKeyEventBuilder::new("status.transition").with_event_type("status");
        let task = task();
        let properties = builder.properties(&task);

        assert_eq!(properties.message_id, Some(task.id.to_string()));
        assert_eq!(
            properties.headers.get(EVENT_TYPE_HEADER).map(String::as_str),
            Some("status")
        );
        assert_eq!(builder.routing_key(), Some("status.transition"));
    }

    #[test]
    fn test_closure_builder() {
        let builder = |task: &ScheduledTask| -> Result<OutboundEvent, EventError> {
            if task.payload.get("reminder_id").is_none() {
                return Err(EventError::InvalidTask {
                    task_id: task.id,
                    reason: "missing reminder_id".to_string(),
                });
            }
            Ok(OutboundEvent {
                routing_key: format!("reminder.{}", task.kind),
                body: task.payload.to_string().into_bytes(),
            })
        };

        let event = builder.build(&task()).unwrap();
        assert_eq!(event.routing_key, "reminder.reminder");
        assert_eq!(builder.routing_key(), None);

        let mut bad = task();
        bad.payload = serde_json::json!({});
        assert!(matches!(builder.build(&bad), Err(EventError::InvalidTask { .. })));
    }
}
