// Scheduler module: the generic due-time daemon and its event builders

pub mod engine;
pub mod event;

pub use engine::{SchedulerDaemon, SchedulerOptions, Step};
pub use event::{EventBuilder, RoutingKeyEventBuilder, EVENT_TYPE_HEADER};
