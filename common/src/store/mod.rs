// Trigger store access: the seam between the scheduler loop and the task table

pub mod memory;

pub use memory::InMemoryTaskStore;

use crate::errors::DatabaseError;
use crate::models::ScheduledTask;
use async_trait::async_trait;
use uuid::Uuid;

/// Read side used by the scheduler daemon
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The unprocessed task of `kind` with the smallest `due_at`, if any
    async fn next_pending(&self, kind: &str) -> Result<Option<ScheduledTask>, DatabaseError>;

    /// Open a transaction holding an exclusive lock on the unprocessed task.
    ///
    /// Returns `None` when the task is already processed or claimed elsewhere.
    async fn claim(&self, task_id: Uuid) -> Result<Option<Box<dyn TaskClaim>>, DatabaseError>;
}

/// An open transaction over one unprocessed task.
///
/// Dropping a claim without calling `complete` rolls the transaction back and
/// leaves the task eligible.
#[async_trait]
pub trait TaskClaim: Send {
    fn task(&self) -> &ScheduledTask;

    /// Mark the task processed and commit
    async fn complete(self: Box<Self>) -> Result<(), DatabaseError>;

    /// Roll back explicitly, surfacing rollback errors
    async fn abandon(self: Box<Self>) -> Result<(), DatabaseError>;
}
