// In-process change notifications with the same fan-out as NOTIFY

use super::{ChangeListener, Wake};
use crate::errors::DatabaseError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Fan-out hub: every subscribed listener sees every notification
#[derive(Debug, Clone, Default)]
pub struct ChangeHub {
    listeners: Arc<Mutex<Vec<Arc<Notify>>>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ChannelChangeListener {
        let notify = Arc::new(Notify::new());
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(notify.clone());
        }
        ChannelChangeListener { notify }
    }

    pub fn notify(&self) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                // notify_one stores a permit when nobody is waiting yet
                listener.notify_one();
            }
        }
    }
}

/// Listener half handed to one daemon
#[derive(Debug)]
pub struct ChannelChangeListener {
    notify: Arc<Notify>,
}

#[async_trait]
impl ChangeListener for ChannelChangeListener {
    async fn wait_for_change(&mut self, timeout: Duration) -> Result<Wake, DatabaseError> {
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => Ok(Wake::Notified),
            Err(_) => Ok(Wake::TimedOut),
        }
    }
}
