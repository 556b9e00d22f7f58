use common::SagaId;
use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// A stale write: the stored version did not match the version the
    /// writer loaded. The writer must reload and retry its transition.
    #[error(
        "Concurrent update of saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrentUpdate {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga instance was not found in the store.
    #[error("Saga instance not found: {0}")]
    NotFound(SagaId),

    /// A stored row could not be turned back into a record.
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),

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

impl StateStoreError {
    /// Returns true for version conflicts, which callers resolve by reloading.
    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, StateStoreError::ConcurrentUpdate { .. })
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
