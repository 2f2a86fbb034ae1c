// Error handling framework

use thiserror::Error;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Notification listener failed: {0}")]
    ListenerFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Broker-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Failed to open channel: {0}")]
    Channel(String),

    #[error("Failed to declare {kind} '{name}': {reason}")]
    Declaration {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Publish rejected by broker: {0}")]
    PublishNacked(String),

    #[error("Message returned as unroutable: {0}")]
    Unroutable(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),
}

/// Static topology and ownership configuration errors.
///
/// These are raised before any daemon loop starts.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Topology contains no queue bindings")]
    Empty,

    #[error("Blank name for {0}")]
    BlankName(&'static str),

    #[error("Primary queue '{0}' is declared more than once")]
    DuplicateQueue(String),

    #[error("Primary queue '{0}' has no routing keys")]
    NoRoutingKeys(String),

    #[error("Dead letter queue '{dlq}' is shared by '{first}' and '{second}'")]
    SharedDeadLetterQueue {
        dlq: String,
        first: String,
        second: String,
    },

    #[error("Queue '{0}' is used both as a primary queue and as a dead letter queue")]
    QueueRoleConflict(String),

    #[error("Dead letter queue '{0}' is not mapped to any primary queue")]
    UnknownDeadLetterQueue(String),

    #[error("No dead letter queues listed for draining; name each owned DLQ explicitly")]
    NoOwnedQueues,

    #[error("Dead letter queue '{0}' is listed for draining more than once")]
    DuplicateOwner(String),

    #[error("Routing key '{0}' does not match any primary queue binding")]
    UnroutableKey(String),

    #[error("Task kind '{0}' is configured for more than one scheduler daemon")]
    DuplicateKind(String),
}

/// Event construction errors (raised by event builders)
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to serialize event body: {0}")]
    SerializationFailed(String),

    #[error("Task {task_id} cannot be turned into an event: {reason}")]
    InvalidTask { task_id: uuid::Uuid, reason: String },
}

/// Errors surfaced by a single daemon iteration
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

// Implement From for common external errors
impl QueueError {
    /// True when the failure concerns one message and the connection is still usable
    pub fn is_message_specific(&self) -> bool {
        matches!(self, Self::PublishNacked(_) | Self::Unroutable(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::SerializationFailed(err.to_string())
    }
}
