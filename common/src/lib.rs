// Common library shared by the scheduler and retrier daemons

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod dlq;
pub mod errors;
pub mod models;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod topology;
