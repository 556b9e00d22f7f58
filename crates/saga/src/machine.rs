//! Pure saga state machine.
//!
//! [`apply`] takes a definition, a mutable instance and one input and decides
//! what happens next. It performs no I/O: the engine persists the mutated
//! instance and then carries out the returned [`Action`]s.
//!
//! ```text
//! RUNNING --(success, more)--> RUNNING
//! RUNNING --(success, last)--> COMPLETED
//! RUNNING --(exhausted/business)--> COMPENSATING | COMPENSATED
//! COMPENSATING --(undo ok, more)--> COMPENSATING
//! COMPENSATING --(undo ok, none left)--> COMPENSATED
//! COMPENSATING --(undo exhausted)--> FAILED
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use state_store::{Direction, SagaInstance, SagaStatus, StepOutcome};

use crate::config::RetryLimits;
use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::{FailureKind, StepFailure};

/// Something that happened to an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The instance was just created.
    Start,
    StepSucceeded {
        step_name: String,
        result: Value,
    },
    StepFailed {
        step_name: String,
        failure: StepFailure,
    },
    CompensationSucceeded {
        step_name: String,
    },
    CompensationFailed {
        step_name: String,
        message: String,
        attempt: u32,
    },
    /// Re-issue the outstanding command at its current attempt.
    Resume,
    /// The outstanding command got no reply; fail it if the instance was
    /// last touched before `stale_before`.
    Expire { stale_before: DateTime<Utc> },
}

/// A side effect the engine must perform after persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Dispatch {
        step_index: usize,
        direction: Direction,
        attempt: u32,
    },
    Alert {
        step_name: String,
        reason: String,
    },
}

/// Why an input left the instance untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    /// The instance already reached a terminal status.
    Terminal(SagaStatus),
    /// The instance was already started.
    AlreadyStarted,
    /// The event refers to a step other than the one in flight.
    NotInFlight { step_name: String },
    /// The event's direction does not match the instance's phase.
    WrongPhase { step_name: String, status: SagaStatus },
    /// A forward success arrived after the step was given up on.
    LateSuccess { step_name: String },
    /// The step's outcome was already recorded.
    AlreadySettled { step_name: String, outcome: StepOutcome },
    /// A failure for an attempt that has since been superseded.
    StaleAttempt {
        step_name: String,
        attempt: u32,
        current: u32,
    },
    /// A failure for an attempt that was never dispatched.
    UnknownAttempt {
        step_name: String,
        attempt: u32,
        current: u32,
    },
    /// The instance made progress after the expiry cutoff.
    NotStale,
}

impl Ignored {
    /// Returns true for inputs that duplicate one already processed.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Ignored::AlreadySettled { .. } | Ignored::StaleAttempt { .. } | Ignored::AlreadyStarted
        )
    }
}

/// Result of applying an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The instance changed; persist it, then perform the actions.
    Advanced(Vec<Action>),
    /// Nothing changed; perform the actions without saving.
    Unchanged(Vec<Action>),
    /// The input does not apply to the current state.
    Ignored(Ignored),
}

/// Applies one input to an instance.
pub fn apply(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    input: Input,
    limits: RetryLimits,
) -> Result<Transition> {
    if definition.steps.len() != instance.step_results.len() {
        return Err(SagaError::InvalidDefinition(format!(
            "definition '{}' has {} steps but saga {} records {}",
            definition.name,
            definition.steps.len(),
            instance.saga_id,
            instance.step_results.len()
        )));
    }
    if instance.status.is_terminal() {
        return Ok(Transition::Ignored(Ignored::Terminal(instance.status)));
    }

    match input {
        Input::Start => Ok(start(instance)),
        Input::StepSucceeded { step_name, result } => {
            let index = step_index(instance, &step_name)?;
            Ok(step_succeeded(definition, instance, index, result))
        }
        Input::StepFailed { step_name, failure } => {
            let index = step_index(instance, &step_name)?;
            Ok(step_failed(definition, instance, index, failure, limits))
        }
        Input::CompensationSucceeded { step_name } => {
            let index = step_index(instance, &step_name)?;
            Ok(compensation_succeeded(definition, instance, index))
        }
        Input::CompensationFailed {
            step_name,
            message,
            attempt,
        } => {
            let index = step_index(instance, &step_name)?;
            Ok(compensation_failed(instance, index, message, attempt, limits))
        }
        Input::Resume => Ok(resume(definition, instance)),
        Input::Expire { stale_before } => Ok(expire(definition, instance, stale_before, limits)),
    }
}

fn step_index(instance: &SagaInstance, step_name: &str) -> Result<usize> {
    instance
        .step_index(step_name)
        .ok_or_else(|| SagaError::UnknownStep {
            saga_id: instance.saga_id,
            step_name: step_name.to_string(),
        })
}

fn start(instance: &mut SagaInstance) -> Transition {
    if instance.status != SagaStatus::Running
        || instance.current_index != 0
        || instance.step_results[0].attempts > 0
    {
        return Transition::Ignored(Ignored::AlreadyStarted);
    }
    Transition::Advanced(vec![dispatch_forward(instance, 0)])
}

/// Checks that `index` is the step in flight for the given phase.
fn in_flight_check(
    instance: &SagaInstance,
    index: usize,
    phase: SagaStatus,
    expected: StepOutcome,
) -> Option<Ignored> {
    let step = &instance.step_results[index];
    if instance.status != phase {
        return Some(Ignored::WrongPhase {
            step_name: step.step_name.clone(),
            status: instance.status,
        });
    }
    if index != instance.current_index {
        if step.outcome == expected {
            return Some(Ignored::NotInFlight {
                step_name: step.step_name.clone(),
            });
        }
        return Some(Ignored::AlreadySettled {
            step_name: step.step_name.clone(),
            outcome: step.outcome,
        });
    }
    if step.outcome != expected {
        return Some(Ignored::AlreadySettled {
            step_name: step.step_name.clone(),
            outcome: step.outcome,
        });
    }
    None
}

/// A failure only counts for the attempt currently in flight.
fn attempt_check(step_name: &str, attempt: u32, current: u32) -> Option<Ignored> {
    if attempt < current {
        return Some(Ignored::StaleAttempt {
            step_name: step_name.to_string(),
            attempt,
            current,
        });
    }
    if attempt > current {
        return Some(Ignored::UnknownAttempt {
            step_name: step_name.to_string(),
            attempt,
            current,
        });
    }
    None
}

fn step_succeeded(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    index: usize,
    result: Value,
) -> Transition {
    if instance.status == SagaStatus::Compensating
        && instance.step_results[index].outcome == StepOutcome::Failed
    {
        return Transition::Ignored(Ignored::LateSuccess {
            step_name: instance.step_results[index].step_name.clone(),
        });
    }
    if let Some(ignored) = in_flight_check(instance, index, SagaStatus::Running, StepOutcome::Pending)
    {
        return Transition::Ignored(ignored);
    }

    let step = &mut instance.step_results[index];
    step.outcome = StepOutcome::Done;
    step.result = Some(result);
    step.last_error = None;

    let next = index + 1;
    if next == definition.steps.len() {
        instance.current_index = next;
        instance.status = SagaStatus::Completed;
        return Transition::Advanced(vec![]);
    }

    instance.current_index = next;
    Transition::Advanced(vec![dispatch_forward(instance, next)])
}

fn step_failed(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    index: usize,
    failure: StepFailure,
    limits: RetryLimits,
) -> Transition {
    if let Some(ignored) = in_flight_check(instance, index, SagaStatus::Running, StepOutcome::Pending)
    {
        return Transition::Ignored(ignored);
    }

    let step = &mut instance.step_results[index];
    if let Some(ignored) = attempt_check(&step.step_name, failure.attempt, step.attempts) {
        return Transition::Ignored(ignored);
    }
    step.last_error = Some(failure.message.clone());

    let participant = definition.steps[index].forward.participant.clone();
    let reason = match failure.kind {
        FailureKind::Transient if step.attempts < limits.max_step_attempts => {
            return Transition::Advanced(vec![dispatch_forward(instance, index)]);
        }
        FailureKind::Transient => SagaError::TransientParticipant {
            participant,
            message: format!(
                "{} (gave up after {} attempts)",
                failure.message, step.attempts
            ),
        },
        FailureKind::Business => SagaError::BusinessRejection {
            participant,
            message: failure.message,
        },
    };

    step.outcome = StepOutcome::Failed;
    instance.failure_reason = Some(format!("step '{}' failed: {}", step.step_name, reason));
    instance.status = SagaStatus::Compensating;
    Transition::Advanced(compensate_below(definition, instance, index))
}

fn compensation_succeeded(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    index: usize,
) -> Transition {
    if let Some(ignored) =
        in_flight_check(instance, index, SagaStatus::Compensating, StepOutcome::Done)
    {
        return Transition::Ignored(ignored);
    }

    let step = &mut instance.step_results[index];
    step.outcome = StepOutcome::Undone;
    step.last_error = None;
    Transition::Advanced(compensate_below(definition, instance, index))
}

fn compensation_failed(
    instance: &mut SagaInstance,
    index: usize,
    message: String,
    attempt: u32,
    limits: RetryLimits,
) -> Transition {
    if let Some(ignored) =
        in_flight_check(instance, index, SagaStatus::Compensating, StepOutcome::Done)
    {
        return Transition::Ignored(ignored);
    }

    let step = &mut instance.step_results[index];
    if let Some(ignored) = attempt_check(&step.step_name, attempt, step.compensation_attempts) {
        return Transition::Ignored(ignored);
    }
    step.last_error = Some(message.clone());

    if step.compensation_attempts < limits.max_compensation_attempts {
        return Transition::Advanced(vec![dispatch_compensation(instance, index)]);
    }

    let error = SagaError::Compensation {
        step_name: step.step_name.clone(),
        message: format!(
            "{} (gave up after {} attempts)",
            message, step.compensation_attempts
        ),
    };
    step.needs_intervention = true;
    let reason = error.to_string();
    let step_name = step.step_name.clone();

    instance.status = SagaStatus::Failed;
    instance.alert_pending = true;
    instance.failure_reason = Some(match instance.failure_reason.take() {
        Some(original) => format!("{original}; {reason}"),
        None => reason.clone(),
    });
    Transition::Advanced(vec![Action::Alert { step_name, reason }])
}

fn resume(definition: &SagaDefinition, instance: &mut SagaInstance) -> Transition {
    let index = instance.current_index;
    match instance.status {
        SagaStatus::Running => {
            let Some(step) = instance.step_results.get(index) else {
                // Every step is done but the completion was never recorded.
                instance.status = SagaStatus::Completed;
                return Transition::Advanced(vec![]);
            };
            if step.outcome != StepOutcome::Pending {
                return Transition::Ignored(Ignored::AlreadySettled {
                    step_name: step.step_name.clone(),
                    outcome: step.outcome,
                });
            }
            if step.attempts == 0 {
                return Transition::Advanced(vec![dispatch_forward(instance, index)]);
            }
            Transition::Unchanged(vec![Action::Dispatch {
                step_index: index,
                direction: Direction::Forward,
                attempt: step.attempts,
            }])
        }
        SagaStatus::Compensating => {
            let pending = instance
                .step_results
                .get(index)
                .filter(|step| {
                    step.outcome == StepOutcome::Done && definition.steps[index].is_compensable()
                })
                .map(|step| step.compensation_attempts);

            match pending {
                Some(0) => Transition::Advanced(vec![dispatch_compensation(instance, index)]),
                Some(attempt) => Transition::Unchanged(vec![Action::Dispatch {
                    step_index: index,
                    direction: Direction::Compensate,
                    attempt,
                }]),
                // The cursor is not on a step awaiting undo; walk down from it.
                None => {
                    let upper = (index + 1).min(instance.step_results.len());
                    Transition::Advanced(compensate_below(definition, instance, upper))
                }
            }
        }
        status => Transition::Ignored(Ignored::Terminal(status)),
    }
}

fn expire(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    stale_before: DateTime<Utc>,
    limits: RetryLimits,
) -> Transition {
    if instance.updated_at >= stale_before {
        return Transition::Ignored(Ignored::NotStale);
    }
    let index = instance.current_index;
    let Some(step) = instance.step_results.get(index) else {
        return resume(definition, instance);
    };
    let message = "timed out waiting for a reply".to_string();

    match instance.status {
        SagaStatus::Running => {
            let failure = StepFailure::transient(message, step.attempts);
            step_failed(definition, instance, index, failure, limits)
        }
        SagaStatus::Compensating => {
            let attempt = step.compensation_attempts;
            compensation_failed(instance, index, message, attempt, limits)
        }
        status => Transition::Ignored(Ignored::Terminal(status)),
    }
}

/// Moves the reverse cursor to the highest `DONE` step below `upper` and
/// dispatches its compensation.
///
/// `DONE` steps without a compensating command are marked `UNDONE` as the
/// cursor passes them. With nothing left to undo the saga is `COMPENSATED`.
fn compensate_below(
    definition: &SagaDefinition,
    instance: &mut SagaInstance,
    upper: usize,
) -> Vec<Action> {
    let mut cursor = upper;
    while cursor > 0 {
        cursor -= 1;
        if instance.step_results[cursor].outcome != StepOutcome::Done {
            continue;
        }
        if definition.steps[cursor].is_compensable() {
            instance.current_index = cursor;
            return vec![dispatch_compensation(instance, cursor)];
        }
        instance.step_results[cursor].outcome = StepOutcome::Undone;
    }

    instance.current_index = 0;
    instance.status = SagaStatus::Compensated;
    vec![]
}

fn dispatch_forward(instance: &mut SagaInstance, index: usize) -> Action {
    let step = &mut instance.step_results[index];
    step.attempts += 1;
    Action::Dispatch {
        step_index: index,
        direction: Direction::Forward,
        attempt: step.attempts,
    }
}

fn dispatch_compensation(instance: &mut SagaInstance, index: usize) -> Action {
    let step = &mut instance.step_results[index];
    step.compensation_attempts += 1;
    Action::Dispatch {
        step_index: index,
        direction: Direction::Compensate,
        attempt: step.compensation_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;
    use common::SagaId;

    fn definition() -> SagaDefinition {
        SagaDefinition::builder("Trip")
            .step(StepDefinition::new("flight", "flights", "reserve").compensated_by("flights", "cancel"))
            .step(StepDefinition::new("hotel", "hotels", "book").compensated_by("hotels", "cancel"))
            .step(StepDefinition::new("payment", "payments", "charge").compensated_by("payments", "refund"))
            .build()
            .unwrap()
    }

    fn limits() -> RetryLimits {
        RetryLimits {
            max_step_attempts: 3,
            max_compensation_attempts: 2,
        }
    }

    fn started(def: &SagaDefinition) -> SagaInstance {
        let mut instance = SagaInstance::new(
            SagaId::new(),
            def.name.clone(),
            def.step_names(),
            serde_json::json!({"trip": 1}),
        );
        apply(def, &mut instance, Input::Start, limits()).unwrap();
        instance
    }

    fn succeed(def: &SagaDefinition, instance: &mut SagaInstance, step: &str) -> Transition {
        let input = Input::StepSucceeded {
            step_name: step.to_string(),
            result: serde_json::json!({"ref": step}),
        };
        apply(def, instance, input, limits()).unwrap()
    }

    fn fail(
        def: &SagaDefinition,
        instance: &mut SagaInstance,
        step: &str,
        failure: StepFailure,
    ) -> Transition {
        let input = Input::StepFailed {
            step_name: step.to_string(),
            failure,
        };
        apply(def, instance, input, limits()).unwrap()
    }

    fn undo(def: &SagaDefinition, instance: &mut SagaInstance, step: &str) -> Transition {
        let input = Input::CompensationSucceeded {
            step_name: step.to_string(),
        };
        apply(def, instance, input, limits()).unwrap()
    }

    fn dispatch(step_index: usize, direction: Direction, attempt: u32) -> Action {
        Action::Dispatch {
            step_index,
            direction,
            attempt,
        }
    }

    #[test]
    fn start_dispatches_first_step() {
        let def = definition();
        let mut instance = SagaInstance::new(SagaId::new(), "Trip", def.step_names(), serde_json::json!({"a": 1}));

        let transition = apply(&def, &mut instance, Input::Start, limits()).unwrap();
        assert_eq!(
            transition,
            Transition::Advanced(vec![dispatch(0, Direction::Forward, 1)])
        );
        assert_eq!(instance.step_results[0].attempts, 1);

        let again = apply(&def, &mut instance, Input::Start, limits()).unwrap();
        assert_eq!(again, Transition::Ignored(Ignored::AlreadyStarted));
    }

    #[test]
    fn all_steps_succeed_completes() {
        let def = definition();
        let mut instance = started(&def);

        assert_eq!(
            succeed(&def, &mut instance, "flight"),
            Transition::Advanced(vec![dispatch(1, Direction::Forward, 1)])
        );
        assert_eq!(
            succeed(&def, &mut instance, "hotel"),
            Transition::Advanced(vec![dispatch(2, Direction::Forward, 1)])
        );
        assert_eq!(succeed(&def, &mut instance, "payment"), Transition::Advanced(vec![]));

        assert_eq!(instance.status, SagaStatus::Completed);
        assert!(instance
            .step_results
            .iter()
            .all(|s| s.outcome == StepOutcome::Done && s.compensation_attempts == 0));
        assert_eq!(
            instance.step("hotel").unwrap().result,
            Some(serde_json::json!({"ref": "hotel"}))
        );
    }

    #[test]
    fn duplicate_success_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        let snapshot = instance.clone();

        let transition = succeed(&def, &mut instance, "flight");
        assert!(matches!(
            transition,
            Transition::Ignored(Ignored::AlreadySettled { ref step_name, outcome: StepOutcome::Done })
                if step_name == "flight"
        ));
        assert_eq!(instance, snapshot);
    }

    #[test]
    fn success_for_step_not_yet_dispatched_is_ignored() {
        let def = definition();
        let mut instance = started(&def);

        let transition = succeed(&def, &mut instance, "payment");
        assert!(matches!(transition, Transition::Ignored(Ignored::NotInFlight { .. })));
        assert_eq!(instance.current_index, 0);
    }

    #[test]
    fn unknown_step_is_an_error() {
        let def = definition();
        let mut instance = started(&def);
        let input = Input::StepSucceeded {
            step_name: "car".to_string(),
            result: Value::Null,
        };

        let result = apply(&def, &mut instance, input, limits());
        assert!(matches!(result, Err(SagaError::UnknownStep { .. })));
    }

    #[test]
    fn transient_failure_retries_until_ceiling() {
        let def = definition();
        let mut instance = started(&def);

        assert_eq!(
            fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 1)),
            Transition::Advanced(vec![dispatch(0, Direction::Forward, 2)])
        );
        assert_eq!(
            fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 2)),
            Transition::Advanced(vec![dispatch(0, Direction::Forward, 3)])
        );

        // Third failure reaches the ceiling; nothing is done so the saga is compensated
        assert_eq!(
            fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 3)),
            Transition::Advanced(vec![])
        );
        assert_eq!(instance.status, SagaStatus::Compensated);
        assert_eq!(instance.step_results[0].outcome, StepOutcome::Failed);
        assert_eq!(instance.step_results[0].attempts, 3);
        assert!(instance.failure_reason.as_deref().unwrap().contains("flight"));
    }

    #[test]
    fn stale_failure_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 1));

        // A second copy of the attempt-1 failure must not burn attempt 2
        let transition = fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 1));
        assert!(matches!(
            transition,
            Transition::Ignored(Ignored::StaleAttempt { attempt: 1, current: 2, .. })
        ));
        assert_eq!(instance.step_results[0].attempts, 2);
    }

    #[test]
    fn failure_for_undispatched_attempt_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        let snapshot = instance.clone();

        let transition = fail(&def, &mut instance, "flight", StepFailure::transient("timeout", 2));
        assert!(matches!(
            transition,
            Transition::Ignored(Ignored::UnknownAttempt { attempt: 2, current: 1, .. })
        ));
        assert_eq!(instance, snapshot);
    }

    #[test]
    fn compensation_failure_for_undispatched_attempt_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        fail(&def, &mut instance, "hotel", StepFailure::business("full", 1));
        let snapshot = instance.clone();

        let input = Input::CompensationFailed {
            step_name: "flight".to_string(),
            message: "airline down".to_string(),
            attempt: 5,
        };
        let transition = apply(&def, &mut instance, input, limits()).unwrap();
        assert!(matches!(
            transition,
            Transition::Ignored(Ignored::UnknownAttempt { attempt: 5, current: 1, .. })
        ));
        assert_eq!(instance, snapshot);
    }

    #[test]
    fn business_failure_compensates_in_reverse_order() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        succeed(&def, &mut instance, "hotel");

        let transition = fail(&def, &mut instance, "payment", StepFailure::business("declined", 1));
        assert_eq!(
            transition,
            Transition::Advanced(vec![dispatch(1, Direction::Compensate, 1)])
        );
        assert_eq!(instance.status, SagaStatus::Compensating);
        assert_eq!(instance.current_index, 1);

        assert_eq!(
            undo(&def, &mut instance, "hotel"),
            Transition::Advanced(vec![dispatch(0, Direction::Compensate, 1)])
        );
        assert_eq!(undo(&def, &mut instance, "flight"), Transition::Advanced(vec![]));

        assert_eq!(instance.status, SagaStatus::Compensated);
        let outcomes: Vec<_> = instance.step_results.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![StepOutcome::Undone, StepOutcome::Undone, StepOutcome::Failed]
        );
        assert!(instance.failure_reason.as_deref().unwrap().contains("declined"));
    }

    #[test]
    fn non_compensable_steps_are_undone_trivially() {
        let mut def = definition();
        def.steps[1].compensation = None;
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        succeed(&def, &mut instance, "hotel");

        let transition = fail(&def, &mut instance, "payment", StepFailure::business("declined", 1));
        assert_eq!(
            transition,
            Transition::Advanced(vec![dispatch(0, Direction::Compensate, 1)])
        );
        assert_eq!(instance.step_results[1].outcome, StepOutcome::Undone);
        assert_eq!(instance.step_results[1].compensation_attempts, 0);
    }

    #[test]
    fn late_success_during_compensation_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        fail(&def, &mut instance, "hotel", StepFailure::business("full", 1));

        let transition = succeed(&def, &mut instance, "hotel");
        assert!(matches!(transition, Transition::Ignored(Ignored::LateSuccess { .. })));
        assert_eq!(instance.step_results[1].outcome, StepOutcome::Failed);
    }

    #[test]
    fn exhausted_compensation_fails_with_one_alert() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        fail(&def, &mut instance, "hotel", StepFailure::business("full", 1));

        let failed = |attempt| Input::CompensationFailed {
            step_name: "flight".to_string(),
            message: "airline down".to_string(),
            attempt,
        };

        assert_eq!(
            apply(&def, &mut instance, failed(1), limits()).unwrap(),
            Transition::Advanced(vec![dispatch(0, Direction::Compensate, 2)])
        );
        let transition = apply(&def, &mut instance, failed(2), limits()).unwrap();
        let Transition::Advanced(actions) = transition else {
            panic!("expected escalation");
        };
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Alert { step_name, .. } if step_name == "flight"));

        assert_eq!(instance.status, SagaStatus::Failed);
        assert!(instance.alert_pending);
        assert!(instance.step_results[0].needs_intervention);
        assert!(instance.failure_reason.as_deref().unwrap().contains("airline down"));

        // Terminal: further input changes nothing
        let again = apply(&def, &mut instance, failed(2), limits()).unwrap();
        assert_eq!(again, Transition::Ignored(Ignored::Terminal(SagaStatus::Failed)));
    }

    #[test]
    fn resume_redispatches_current_attempt() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        let snapshot = instance.clone();

        let transition = apply(&def, &mut instance, Input::Resume, limits()).unwrap();
        assert_eq!(
            transition,
            Transition::Unchanged(vec![dispatch(1, Direction::Forward, 1)])
        );
        assert_eq!(instance, snapshot);
    }

    #[test]
    fn resume_during_compensation_redispatches_undo() {
        let def = definition();
        let mut instance = started(&def);
        succeed(&def, &mut instance, "flight");
        succeed(&def, &mut instance, "hotel");
        fail(&def, &mut instance, "payment", StepFailure::business("declined", 1));

        let transition = apply(&def, &mut instance, Input::Resume, limits()).unwrap();
        assert_eq!(
            transition,
            Transition::Unchanged(vec![dispatch(1, Direction::Compensate, 1)])
        );
    }

    #[test]
    fn resume_of_terminal_instance_is_ignored() {
        let def = definition();
        let mut instance = started(&def);
        instance.status = SagaStatus::Compensated;

        let transition = apply(&def, &mut instance, Input::Resume, limits()).unwrap();
        assert_eq!(transition, Transition::Ignored(Ignored::Terminal(SagaStatus::Compensated)));
    }

    #[test]
    fn expire_counts_as_transient_failure() {
        let def = definition();
        let mut instance = started(&def);
        let cutoff = instance.updated_at + chrono::Duration::seconds(1);

        let transition = apply(&def, &mut instance, Input::Expire { stale_before: cutoff }, limits()).unwrap();
        assert_eq!(
            transition,
            Transition::Advanced(vec![dispatch(0, Direction::Forward, 2)])
        );
        assert_eq!(
            instance.step_results[0].last_error.as_deref(),
            Some("timed out waiting for a reply")
        );
    }

    #[test]
    fn expire_skips_recently_updated_instances() {
        let def = definition();
        let mut instance = started(&def);
        let cutoff = instance.updated_at - chrono::Duration::seconds(1);

        let transition = apply(&def, &mut instance, Input::Expire { stale_before: cutoff }, limits()).unwrap();
        assert_eq!(transition, Transition::Ignored(Ignored::NotStale));
    }

    #[test]
    fn definition_mismatch_is_rejected() {
        let def = definition();
        let mut instance = SagaInstance::new(SagaId::new(), "Trip", ["flight"], serde_json::json!({"a": 1}));

        let result = apply(&def, &mut instance, Input::Start, limits());
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }
}
