// Change notifications: how a daemon learns the trigger store moved

pub mod channel;
pub mod postgres;

pub use channel::{ChangeHub, ChannelChangeListener};
pub use postgres::PgChangeListener;

use crate::errors::DatabaseError;
use async_trait::async_trait;
use std::time::Duration;

/// Why a bounded wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Notified,
    TimedOut,
}

/// Wait for "something changed" signals.
///
/// Signals carry no payload: callers re-query the store after every wake.
/// Implementations must be cancel-safe, the scheduler races this wait
/// against shutdown.
#[async_trait]
pub trait ChangeListener: Send {
    async fn wait_for_change(&mut self, timeout: Duration) -> Result<Wake, DatabaseError>;
}
