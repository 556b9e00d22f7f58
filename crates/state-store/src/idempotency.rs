//! Idempotency records guarding command dispatch.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

/// Which command of a step a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The step's forward action.
    #[default]
    Forward,
    /// The step's compensating action.
    Compensate,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "compensate" => Ok(Direction::Compensate),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Identifies one dispatch of one command of one step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub saga_id: SagaId,
    pub step_name: String,
    pub direction: Direction,
    pub attempt: u32,
}

impl IdempotencyKey {
    pub fn new(
        saga_id: SagaId,
        step_name: impl Into<String>,
        direction: Direction,
        attempt: u32,
    ) -> Self {
        Self {
            saga_id,
            step_name: step_name.into(),
            direction,
            attempt,
        }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.saga_id, self.step_name, self.direction, self.attempt
        )
    }
}

/// Last known outcome of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    /// Sent, no reply processed yet.
    Dispatched,
    Succeeded,
    Failed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched => "DISPATCHED",
            DispatchOutcome::Succeeded => "SUCCEEDED",
            DispatchOutcome::Failed => "FAILED",
        }
    }
}

impl FromStr for DispatchOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISPATCHED" => Ok(DispatchOutcome::Dispatched),
            "SUCCEEDED" => Ok(DispatchOutcome::Succeeded),
            "FAILED" => Ok(DispatchOutcome::Failed),
            other => Err(format!("unknown dispatch outcome '{other}'")),
        }
    }
}

/// A stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub outcome: DispatchOutcome,
    pub dispatched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates a record for a command dispatched now.
    pub fn dispatched(key: IdempotencyKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            outcome: DispatchOutcome::Dispatched,
            dispatched_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the record blocks a resend at `now` given the dispatch window.
    ///
    /// Only records still waiting for a reply expire; once an outcome is known
    /// the same attempt is never sent again.
    pub fn blocks_resend(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.outcome {
            DispatchOutcome::Dispatched => self.dispatched_at + window > now,
            DispatchOutcome::Succeeded | DispatchOutcome::Failed => true,
        }
    }
}
