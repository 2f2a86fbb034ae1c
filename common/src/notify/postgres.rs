// PostgreSQL LISTEN/NOTIFY change listener

use super::{ChangeListener, Wake};
use crate::db::DbPool;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Listener on the channel the `scheduled_tasks` trigger notifies.
///
/// Holds its own dedicated connection. sqlx reconnects a dropped listener on
/// the next receive; notifications sent while disconnected are lost, which
/// the caller's bounded wait tolerates.
pub struct PgChangeListener {
    listener: PgListener,
    channel: String,
}

impl PgChangeListener {
    #[instrument(skip(pool))]
    pub async fn connect(pool: &DbPool, channel: &str) -> Result<Self, DatabaseError> {
        let mut listener = PgListener::connect_with(pool.pool())
            .await
            .map_err(|e| DatabaseError::ListenerFailed(e.to_string()))?;

        listener
            .listen(channel)
            .await
            .map_err(|e| DatabaseError::ListenerFailed(e.to_string()))?;

        info!(channel = %channel, "LISTEN started on trigger store channel");

        Ok(Self {
            listener,
            channel: channel.to_string(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ChangeListener for PgChangeListener {
    async fn wait_for_change(&mut self, timeout: Duration) -> Result<Wake, DatabaseError> {
        match tokio::time::timeout(timeout, self.listener.recv()).await {
            Ok(Ok(notification)) => {
                debug!(channel = notification.channel(), "Received NOTIFY");
                Ok(Wake::Notified)
            }
            Ok(Err(e)) => Err(DatabaseError::ListenerFailed(e.to_string())),
            Err(_) => Ok(Wake::TimedOut),
        }
    }
}
