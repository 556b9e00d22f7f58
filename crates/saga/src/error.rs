//! Saga error types.

use common::SagaId;
use state_store::StateStoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered under the requested name.
    #[error("Saga definition not found: {0}")]
    DefinitionNotFound(String),

    /// A definition failed validation at registration time.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The payload submitted at start does not satisfy the definition.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// An event named a step the instance's definition does not have.
    #[error("Unknown step '{step_name}' for saga {saga_id}")]
    UnknownStep { saga_id: SagaId, step_name: String },

    /// Saga instance not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A participant could not be reached or timed out.
    #[error("Participant '{participant}' unavailable: {message}")]
    TransientParticipant {
        participant: String,
        message: String,
    },

    /// A participant explicitly refused a command.
    #[error("Participant '{participant}' rejected the command: {message}")]
    BusinessRejection {
        participant: String,
        message: String,
    },

    /// A compensating command failed.
    #[error("Compensation of step '{step_name}' failed: {message}")]
    Compensation { step_name: String, message: String },

    /// State store error, including version conflicts.
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The event channel of a worker shard is closed.
    #[error("Event channel closed")]
    ChannelClosed,
}

impl SagaError {
    /// Returns true if the error is a store version conflict.
    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, SagaError::StateStore(e) if e.is_concurrent_update())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
