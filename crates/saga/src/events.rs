//! Outbound command and inbound event envelopes exchanged with participants.

use common::SagaId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_store::{Direction, IdempotencyKey};

/// A command sent to a participant for one attempt of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub saga_id: SagaId,
    pub step_name: String,
    pub participant: String,
    pub action: String,
    pub direction: Direction,
    pub attempt: u32,
    /// `{ "input": <saga payload>, "results": { <step>: <result> } }`
    pub payload: Value,
}

impl CommandEnvelope {
    /// Returns the key under which this dispatch is deduplicated.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.saga_id,
            self.step_name.clone(),
            self.direction,
            self.attempt,
        )
    }
}

/// How a participant failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Network trouble or timeout; the command may be retried.
    #[default]
    Transient,
    /// The participant refused; retrying is never correct.
    Business,
}

/// A failed forward attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
}

impl StepFailure {
    pub fn transient(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
            attempt,
        }
    }

    pub fn business(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: FailureKind::Business,
            message: message.into(),
            attempt,
        }
    }
}

/// Outcome reported by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOutcome {
    Succeeded,
    Failed,
}

/// Error details carried by a failed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    #[serde(default)]
    pub kind: FailureKind,
    pub message: String,
}

/// An inbound reply from a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantEvent {
    pub saga_id: SagaId,
    pub step_name: String,
    #[serde(default)]
    pub direction: Direction,
    pub attempt: u32,
    pub outcome: EventOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

impl ParticipantEvent {
    /// Builds the success reply to a command.
    pub fn succeeded(command: &CommandEnvelope, result: Value) -> Self {
        Self {
            saga_id: command.saga_id,
            step_name: command.step_name.clone(),
            direction: command.direction,
            attempt: command.attempt,
            outcome: EventOutcome::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    /// Builds the failure reply to a command.
    pub fn failed(command: &CommandEnvelope, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            saga_id: command.saga_id,
            step_name: command.step_name.clone(),
            direction: command.direction,
            attempt: command.attempt,
            outcome: EventOutcome::Failed,
            result: None,
            error: Some(EventError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Returns the failure kind and message, defaulting when the sender left them out.
    pub fn failure(&self) -> (FailureKind, String) {
        match &self.error {
            Some(error) => (error.kind, error.message.clone()),
            None => (FailureKind::Transient, "no error details reported".to_string()),
        }
    }
}
