// Scheduled task repository: the PostgreSQL trigger store

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{NewTask, ScheduledTask};
use crate::store::{TaskClaim, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, kind, due_at, is_processed, payload, created_at, processed_at";

/// Repository for scheduled task database operations
#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: DbPool,
}

impl TaskRepository {
    /// Create a new TaskRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new task. The table trigger notifies listeners on commit.
    #[instrument(skip(self, new_task), fields(kind = %new_task.kind, due_at = %new_task.due_at))]
    pub async fn schedule(&self, new_task: &NewTask) -> Result<ScheduledTask, DatabaseError> {
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            r#"
            INSERT INTO scheduled_tasks (id, kind, due_at, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&new_task.kind)
        .bind(new_task.due_at)
        .bind(&new_task.payload)
        .fetch_one(self.pool.pool())
        .await?;

        tracing::info!(task_id = %task.id, "Task scheduled");
        Ok(task)
    }

    /// Move the due time of an unprocessed task
    ///
    /// Returns false if the task does not exist or was already processed.
    #[instrument(skip(self))]
    pub async fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET due_at = $2
            WHERE id = $1 AND NOT is_processed
            "#,
        )
        .bind(id)
        .bind(due_at)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Find a task by ID
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduledTask>, DatabaseError> {
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(task)
    }

    /// Count unprocessed tasks of a kind
    #[instrument(skip(self))]
    pub async fn count_pending(&self, kind: &str) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduled_tasks WHERE kind = $1 AND NOT is_processed",
        )
        .bind(kind)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(count)
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    #[instrument(skip(self))]
    async fn next_pending(&self, kind: &str) -> Result<Option<ScheduledTask>, DatabaseError> {
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM scheduled_tasks
            WHERE kind = $1 AND NOT is_processed
            ORDER BY due_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(kind)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(task)
    }

    #[instrument(skip(self))]
    async fn claim(&self, task_id: Uuid) -> Result<Option<Box<dyn TaskClaim>>, DatabaseError> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        // SKIP LOCKED: a row held by another open transaction is not ours to process
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM scheduled_tasks
            WHERE id = $1 AND NOT is_processed
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        match task {
            Some(task) => Ok(Some(Box::new(PgTaskClaim { tx, task }))),
            None => {
                tx.rollback()
                    .await
                    .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
                Ok(None)
            }
        }
    }
}

/// Open transaction holding the row lock of one task
struct PgTaskClaim {
    tx: Transaction<'static, Postgres>,
    task: ScheduledTask,
}

#[async_trait]
impl TaskClaim for PgTaskClaim {
    fn task(&self) -> &ScheduledTask {
        &self.task
    }

    async fn complete(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgTaskClaim { mut tx, task } = *self;

        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET is_processed = TRUE,
                processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        tracing::debug!(task_id = %task.id, "Task marked processed");
        Ok(())
    }

    async fn abandon(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))
    }
}
