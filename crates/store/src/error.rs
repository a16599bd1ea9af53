//! Store error types.

use common::{CorrelationId, SagaId};
use thiserror::Error;

/// Errors that can occur when persisting or loading saga state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A non-terminal saga already exists for the correlation id.
    #[error("An active saga already exists for correlation id {0}")]
    DuplicateSaga(CorrelationId),

    /// A saga with this id already exists.
    #[error("Saga already exists: {0}")]
    DuplicateId(SagaId),

    /// The saga was not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// An update raced with another writer for the same saga id.
    /// The expected version did not match the stored version.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: u64,
        actual: u64,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
