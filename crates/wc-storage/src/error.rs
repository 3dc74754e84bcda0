use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("outbox row not found: {0}")]
    OutboxNotFound(Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Matches the pattern `idempotent-consumer::IdempotencyError` uses for
    /// classifying Postgres errors worth a caller-side retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::PoolTimedOut)
            | StorageError::Database(sqlx::Error::PoolClosed)
            | StorageError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
