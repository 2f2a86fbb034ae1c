// In-memory trigger store with per-task claim locking

use super::{TaskClaim, TaskStore};
use crate::errors::DatabaseError;
use crate::models::{NewTask, ScheduledTask};
use crate::notify::ChangeHub;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    tasks: Vec<ScheduledTask>,
    claimed: HashSet<Uuid>,
}

/// Trigger store kept in process memory.
///
/// Mirrors the PostgreSQL store: inserts and due-time updates fire the change
/// hub like the table trigger does, a claim behaves like a row lock held by
/// an open transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<State>>,
    changes: ChangeHub,
    unavailable: Arc<AtomicBool>,
    failing_commits: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub notified on every insert/update
    pub fn changes(&self) -> &ChangeHub {
        &self.changes
    }

    /// Simulate the database going away (all operations fail while set)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make claim commits fail while reads keep working
    pub fn set_failing_commits(&self, failing: bool) {
        self.failing_commits.store(failing, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DatabaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionFailed(
                "trigger store unavailable".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| DatabaseError::TransactionFailed("store lock poisoned".to_string()))
    }

    pub fn schedule(&self, new_task: NewTask) -> Result<ScheduledTask, DatabaseError> {
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            kind: new_task.kind,
            due_at: new_task.due_at,
            is_processed: false,
            payload: new_task.payload,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.state()?.tasks.push(task.clone());
        self.changes.notify();
        Ok(task)
    }

    /// Move the due time of an unprocessed task; false when nothing changed
    pub fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let updated = {
            let mut state = self.state()?;
            match state
                .tasks
                .iter_mut()
                .find(|t| t.id == id && !t.is_processed)
            {
                Some(task) => {
                    task.due_at = due_at;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.changes.notify();
        }
        Ok(updated)
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduledTask>, DatabaseError> {
        Ok(self.state()?.tasks.iter().find(|t| t.id == id).cloned())
    }

    pub fn tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        Ok(self.state()?.tasks.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn next_pending(&self, kind: &str) -> Result<Option<ScheduledTask>, DatabaseError> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.kind == kind && !t.is_processed)
            .min_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn claim(&self, task_id: Uuid) -> Result<Option<Box<dyn TaskClaim>>, DatabaseError> {
        let mut state = self.state()?;
        let task = match state
            .tasks
            .iter()
            .find(|t| t.id == task_id && !t.is_processed)
        {
            Some(task) => task.clone(),
            None => return Ok(None),
        };
        if !state.claimed.insert(task_id) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryClaim {
            state: self.state.clone(),
            unavailable: self.unavailable.clone(),
            failing_commits: self.failing_commits.clone(),
            task,
            finished: false,
        })))
    }
}

struct MemoryClaim {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    failing_commits: Arc<AtomicBool>,
    task: ScheduledTask,
    finished: bool,
}

impl MemoryClaim {
    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Ok(mut state) = self.state.lock() {
            state.claimed.remove(&self.task.id);
        }
    }
}

#[async_trait]
impl TaskClaim for MemoryClaim {
    fn task(&self) -> &ScheduledTask {
        &self.task
    }

    async fn complete(mut self: Box<Self>) -> Result<(), DatabaseError> {
        if self.unavailable.load(Ordering::SeqCst) || self.failing_commits.load(Ordering::SeqCst) {
            // commit never reached the database; the drop below rolls back
            return Err(DatabaseError::TransactionFailed(
                "trigger store unavailable during commit".to_string(),
            ));
        }
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| DatabaseError::TransactionFailed("store lock poisoned".to_string()))?;
            let id = self.task.id;
            if let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) {
                task.is_processed = true;
                task.processed_at = Some(Utc::now());
            }
            state.claimed.remove(&id);
        }
        self.finished = true;
        Ok(())
    }

    async fn abandon(mut self: Box<Self>) -> Result<(), DatabaseError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.release();
    }
}
