// Broker module: AMQP topology, publishing and dead letter retrieval

pub mod amqp;
pub mod broker;
pub mod envelope;
pub mod memory;

pub use amqp::AmqpBroker;
pub use broker::{Broker, DeathRecord, Delivery, MessageProperties};
pub use envelope::DeadLetterEnvelope;
pub use memory::InMemoryBroker;
