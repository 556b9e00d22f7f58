//! Persisted saga instance record.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::Version;

/// The lifecycle status of a saga instance.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Forward steps are being executed.
    Running,

    /// A step failed and compensating commands are being issued in reverse order.
    Compensating,

    /// Every forward step succeeded (terminal).
    Completed,

    /// Every completed step was undone after a failure (terminal).
    Compensated,

    /// A compensation could not be completed; needs an operator (terminal).
    Failed,
}

impl SagaStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [SagaStatus; 5] = [
        SagaStatus::Running,
        SagaStatus::Compensating,
        SagaStatus::Completed,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Statuses of instances that still have work outstanding.
    pub const IN_FLIGHT: [SagaStatus; 2] = [SagaStatus::Running, SagaStatus::Compensating];

    /// Returns true if no transition can leave this status.
    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    /// Returns true while the instance still has a command outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SagaStatus::Running | SagaStatus::Compensating)
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "RUNNING",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown saga status '{s}'"))
    }
}

/// Outcome of a single step of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Not executed yet, or its forward command is in flight.
    #[default]
    Pending,
    /// The forward command succeeded.
    Done,
    /// The forward command failed permanently.
    Failed,
    /// The step was compensated (or needed no compensation).
    Undone,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "PENDING",
            StepOutcome::Done => "DONE",
            StepOutcome::Failed => "FAILED",
            StepOutcome::Undone => "UNDONE",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recorded progress of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub outcome: StepOutcome,
    /// Number of forward dispatches so far.
    pub attempts: u32,
    /// Number of compensating dispatches so far.
    #[serde(default)]
    pub compensation_attempts: u32,
    pub last_error: Option<String>,
    /// Result payload reported by the participant on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Set when the step's compensation was abandoned and an operator must act.
    #[serde(default)]
    pub needs_intervention: bool,
}

impl StepResult {
    /// Creates a pending result for a step that has not been dispatched.
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            outcome: StepOutcome::Pending,
            attempts: 0,
            compensation_attempts: 0,
            last_error: None,
            result: None,
            needs_intervention: false,
        }
    }
}

/// A saga instance as persisted in the state store.
///
/// The record is mutated exclusively by the saga engine; the `version` field
/// carries the version the record had when it was loaded and is checked on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub definition_name: String,
    pub status: SagaStatus,
    /// Forward pointer while running, reverse cursor while compensating.
    pub current_index: usize,
    /// Input submitted when the saga was started.
    pub payload: serde_json::Value,
    /// One entry per definition step, in definition order.
    pub step_results: Vec<StepResult>,
    pub failure_reason: Option<String>,
    /// Set on entering `Failed`; cleared once the operator alert is delivered.
    #[serde(default)]
    pub alert_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
}

impl SagaInstance {
    /// Creates a new, unsaved instance in `Running` status positioned at step 0.
    pub fn new<I, S>(
        saga_id: SagaId,
        definition_name: impl Into<String>,
        step_names: I,
        payload: serde_json::Value,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            saga_id,
            definition_name: definition_name.into(),
            status: SagaStatus::Running,
            current_index: 0,
            payload,
            step_results: step_names.into_iter().map(StepResult::pending).collect(),
            failure_reason: None,
            alert_pending: false,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Returns the position of a step by name.
    pub fn step_index(&self, step_name: &str) -> Option<usize> {
        self.step_results
            .iter()
            .position(|step| step.step_name == step_name)
    }

    /// Returns the recorded result of a step by name.
    pub fn step(&self, step_name: &str) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|step| step.step_name == step_name)
    }

    /// Returns the step the cursor currently points at.
    pub fn current_step(&self) -> Option<&StepResult> {
        self.step_results.get(self.current_index)
    }

    /// Returns the names of steps whose forward command succeeded and is not undone.
    pub fn done_steps(&self) -> impl Iterator<Item = &str> {
        self.step_results
            .iter()
            .filter(|step| step.outcome == StepOutcome::Done)
            .map(|step| step.step_name.as_str())
    }

    /// Returns true while the instance still has work outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance() -> SagaInstance {
        SagaInstance::new(
            SagaId::new(),
            "TripBooking",
            ["reserve_flight", "book_hotel", "charge_payment"],
            serde_json::json!({"customer": "c-1"}),
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_string_forms() {
        for status in SagaStatus::ALL {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!("running".parse::<SagaStatus>().unwrap(), SagaStatus::Running);
        assert!("PAUSED".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_new_instance_is_running_at_step_zero() {
        let instance = make_instance();
        assert_eq!(instance.status, SagaStatus::Running);
        assert_eq!(instance.current_index, 0);
        assert!(instance.version.is_initial());
        assert_eq!(instance.step_results.len(), 3);
        assert!(
            instance
                .step_results
                .iter()
                .all(|step| step.outcome == StepOutcome::Pending && step.attempts == 0)
        );
        assert_eq!(
            instance.current_step().map(|s| s.step_name.as_str()),
            Some("reserve_flight")
        );
    }

    #[test]
    fn test_step_lookup() {
        let mut instance = make_instance();
        assert_eq!(instance.step_index("book_hotel"), Some(1));
        assert!(instance.step("unknown").is_none());

        instance.step_results[0].outcome = StepOutcome::Done;
        instance.step_results[1].outcome = StepOutcome::Done;
        let done: Vec<_> = instance.done_steps().collect();
        assert_eq!(done, vec!["reserve_flight", "book_hotel"]);
    }

    #[test]
    fn test_record_deserializes_without_optional_step_fields() {
        let instance = make_instance();
        let mut json = serde_json::to_value(&instance).unwrap();
        for step in json["step_results"].as_array_mut().unwrap() {
            let step = step.as_object_mut().unwrap();
            step.remove("compensation_attempts");
            step.remove("result");
            step.remove("needs_intervention");
        }
        let restored: SagaInstance = serde_json::from_value(json).unwrap();
        assert_eq!(restored, instance);
    }
}
