//! Saga engine: drives instances through the state machine.
//!
//! Every entry point runs the same cycle: load the instance, apply the input
//! through [`machine::apply`], save with a version check, then perform the
//! resulting actions. Nothing is dispatched before the state that explains it
//! is durable, so a crash at any point is repaired by [`SagaEngine::resume`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde_json::{Map, Value};
use state_store::{
    Direction, DispatchOutcome, IdempotencyKey, IdempotencyStore, InstanceQuery, SagaInstance,
    SagaStatus, StateStore, StateStoreError, StateStoreExt,
};

use crate::alert::{AlertSink, OperatorAlert};
use crate::config::EngineConfig;
use crate::definition::{DefinitionRegistry, SagaDefinition};
use crate::error::{Result, SagaError};
use crate::events::{CommandEnvelope, EventOutcome, ParticipantEvent, StepFailure};
use crate::gateway::ParticipantGateway;
use crate::guard::IdempotencyGuard;
use crate::machine::{self, Action, Ignored, Input, Transition};

/// Orchestrates saga instances.
///
/// The engine holds no per-instance state in memory; ownership of an instance
/// is decided by the store's version check, so several engines (or a recovery
/// pass and a live worker) can safely race on the same saga.
pub struct SagaEngine<S, I, G>
where
    S: StateStore,
    I: IdempotencyStore,
    G: ParticipantGateway,
{
    store: S,
    guard: IdempotencyGuard<I>,
    gateway: G,
    definitions: Arc<DefinitionRegistry>,
    alerts: Arc<dyn AlertSink>,
    config: EngineConfig,
}

impl<S, I, G> SagaEngine<S, I, G>
where
    S: StateStore,
    I: IdempotencyStore,
    G: ParticipantGateway,
{
    /// Creates a new saga engine.
    pub fn new(
        store: S,
        idempotency: I,
        gateway: G,
        definitions: Arc<DefinitionRegistry>,
        alerts: Arc<dyn AlertSink>,
        config: EngineConfig,
    ) -> Self {
        let guard = IdempotencyGuard::new(idempotency, config.dispatch_window);
        Self {
            store,
            guard,
            gateway,
            definitions,
            alerts,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn idempotency(&self) -> &I {
        self.guard.store()
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a new saga and dispatches its first step.
    ///
    /// Unknown definitions and invalid payloads are rejected before anything
    /// is persisted.
    #[tracing::instrument(skip(self, payload))]
    pub async fn start(&self, definition_name: &str, payload: Value) -> Result<SagaId> {
        let definition = self
            .definitions
            .get(definition_name)
            .ok_or_else(|| SagaError::DefinitionNotFound(definition_name.to_string()))?;
        definition.validate_payload(&payload)?;

        let mut instance = SagaInstance::new(
            SagaId::new(),
            definition.name.clone(),
            definition.step_names(),
            payload,
        );
        let transition =
            machine::apply(&definition, &mut instance, Input::Start, self.config.limits())?;
        self.store.save_and_update(&mut instance).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %instance.saga_id, definition = %definition.name, "saga started");

        // The instance is durable: a failed first dispatch is left to recovery
        if let Transition::Advanced(actions) | Transition::Unchanged(actions) = transition
            && let Err(e) = self.perform(&definition, &instance, actions).await
        {
            metrics::counter!("saga_dispatch_errors_total").increment(1);
            tracing::warn!(saga_id = %instance.saga_id, error = %e, "first dispatch failed; recovery will retry");
        }
        Ok(instance.saga_id)
    }

    /// Records a forward success and moves on to the next step.
    #[tracing::instrument(skip(self, result))]
    pub async fn on_step_succeeded(
        &self,
        saga_id: SagaId,
        step_name: &str,
        result: Value,
    ) -> Result<SagaStatus> {
        let input = Input::StepSucceeded {
            step_name: step_name.to_string(),
            result,
        };
        self.process(saga_id, input).await
    }

    /// Records a forward failure: retry, or start compensating.
    #[tracing::instrument(skip(self))]
    pub async fn on_step_failed(
        &self,
        saga_id: SagaId,
        step_name: &str,
        failure: StepFailure,
    ) -> Result<SagaStatus> {
        let input = Input::StepFailed {
            step_name: step_name.to_string(),
            failure,
        };
        self.process(saga_id, input).await
    }

    /// Records a successful undo and moves the reverse cursor down.
    #[tracing::instrument(skip(self))]
    pub async fn on_compensation_succeeded(
        &self,
        saga_id: SagaId,
        step_name: &str,
    ) -> Result<SagaStatus> {
        let input = Input::CompensationSucceeded {
            step_name: step_name.to_string(),
        };
        self.process(saga_id, input).await
    }

    /// Records a failed undo: retry, or escalate to an operator.
    #[tracing::instrument(skip(self))]
    pub async fn on_compensation_failed(
        &self,
        saga_id: SagaId,
        step_name: &str,
        message: &str,
        attempt: u32,
    ) -> Result<SagaStatus> {
        let input = Input::CompensationFailed {
            step_name: step_name.to_string(),
            message: message.to_string(),
            attempt,
        };
        self.process(saga_id, input).await
    }

    /// Routes an inbound participant event to the matching handler.
    pub async fn handle_event(&self, event: ParticipantEvent) -> Result<SagaStatus> {
        let saga_id = event.saga_id;
        match (event.direction, event.outcome) {
            (Direction::Forward, EventOutcome::Succeeded) => {
                let result = event.result.unwrap_or(Value::Null);
                self.on_step_succeeded(saga_id, &event.step_name, result)
                    .await
            }
            (Direction::Forward, EventOutcome::Failed) => {
                let (kind, message) = event.failure();
                let failure = StepFailure {
                    kind,
                    message,
                    attempt: event.attempt,
                };
                self.on_step_failed(saga_id, &event.step_name, failure)
                    .await
            }
            (Direction::Compensate, EventOutcome::Succeeded) => {
                self.on_compensation_succeeded(saga_id, &event.step_name)
                    .await
            }
            (Direction::Compensate, EventOutcome::Failed) => {
                let (_, message) = event.failure();
                self.on_compensation_failed(saga_id, &event.step_name, &message, event.attempt)
                    .await
            }
        }
    }

    /// Re-dispatches the outstanding command of an in-flight saga.
    ///
    /// Steps already `DONE` or `UNDONE` are never re-run; the idempotency
    /// guard suppresses the resend if the same attempt is still in its
    /// dispatch window.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<SagaStatus> {
        self.process(saga_id, Input::Resume).await
    }

    /// Treats the outstanding command as failed for lack of a reply.
    #[tracing::instrument(skip(self))]
    pub async fn expire(&self, saga_id: SagaId) -> Result<SagaStatus> {
        self.expire_stale(saga_id, DateTime::<Utc>::MAX_UTC).await
    }

    /// Like [`expire`](Self::expire), but only if the instance was last
    /// updated before `stale_before`.
    pub async fn expire_stale(
        &self,
        saga_id: SagaId,
        stale_before: DateTime<Utc>,
    ) -> Result<SagaStatus> {
        self.process(saga_id, Input::Expire { stale_before }).await
    }

    /// Raises the operator alert of a `FAILED` instance whose alert was
    /// never delivered. Returns false if nothing was owed.
    #[tracing::instrument(skip(self))]
    pub async fn redeliver_alert(&self, saga_id: SagaId) -> Result<bool> {
        let instance = self.get(saga_id).await?;
        if instance.status != SagaStatus::Failed || !instance.alert_pending {
            return Ok(false);
        }

        let step_name = instance
            .step_results
            .iter()
            .find(|step| step.needs_intervention)
            .or_else(|| instance.current_step())
            .map(|step| step.step_name.clone())
            .unwrap_or_default();
        let reason = instance
            .failure_reason
            .clone()
            .unwrap_or_else(|| "compensation abandoned".to_string());
        self.deliver_alert(&instance, step_name, reason).await;
        Ok(true)
    }

    /// Retrieves a saga instance.
    pub async fn get(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.store.load(saga_id).await.map_err(not_found)
    }

    /// Retrieves saga instances matching a query.
    pub async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        Ok(self.store.query(query).await?)
    }

    /// Runs load, transition, save and perform, reloading on version conflicts.
    async fn process(&self, saga_id: SagaId, input: Input) -> Result<SagaStatus> {
        let mut conflicts = 0;
        loop {
            let mut instance = self.get(saga_id).await?;
            let definition = self.definition_for(&instance)?;
            let before = instance.status;
            let settled = settled_key(&instance, &input);

            let transition = machine::apply(
                &definition,
                &mut instance,
                input.clone(),
                self.config.limits(),
            )?;

            let actions = match transition {
                Transition::Ignored(reason) => {
                    log_ignored(&instance, &reason);
                    return Ok(instance.status);
                }
                Transition::Unchanged(actions) => actions,
                Transition::Advanced(actions) => {
                    instance.touch();
                    match self.store.save_and_update(&mut instance).await {
                        Ok(_) => {}
                        Err(e)
                            if e.is_concurrent_update()
                                && conflicts < self.config.max_conflict_retries =>
                        {
                            conflicts += 1;
                            metrics::counter!("saga_conflict_retries_total").increment(1);
                            tracing::debug!(%saga_id, conflicts, "version conflict, reloading");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    observe(before, &instance);
                    if let Some((key, outcome)) = settled {
                        self.settle(&key, outcome).await;
                    }
                    actions
                }
            };

            self.perform(&definition, &instance, actions).await?;
            return Ok(instance.status);
        }
    }

    fn definition_for(&self, instance: &SagaInstance) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(&instance.definition_name)
            .ok_or_else(|| SagaError::DefinitionNotFound(instance.definition_name.clone()))
    }

    async fn perform(
        &self,
        definition: &SagaDefinition,
        instance: &SagaInstance,
        actions: Vec<Action>,
    ) -> Result<()> {
        for action in actions {
            match action {
                Action::Dispatch {
                    step_index,
                    direction,
                    attempt,
                } => {
                    self.dispatch(definition, instance, step_index, direction, attempt)
                        .await?
                }
                Action::Alert { step_name, reason } => {
                    self.deliver_alert(instance, step_name, reason).await
                }
            }
        }
        Ok(())
    }

    /// Raises an alert, then clears the instance's pending flag. If the
    /// flag cannot be cleared the alert is raised again by recovery.
    async fn deliver_alert(&self, instance: &SagaInstance, step_name: String, reason: String) {
        let alert = OperatorAlert::new(
            instance.saga_id,
            instance.definition_name.clone(),
            step_name,
            reason,
        );
        self.alerts.raise(alert).await;

        if let Err(e) = self.clear_alert_pending(instance.saga_id).await {
            tracing::warn!(saga_id = %instance.saga_id, error = %e, "alert raised but not marked delivered");
        }
    }

    async fn clear_alert_pending(&self, saga_id: SagaId) -> Result<()> {
        let mut conflicts = 0;
        loop {
            let mut instance = self.get(saga_id).await?;
            if !instance.alert_pending {
                return Ok(());
            }
            instance.alert_pending = false;
            match self.store.save_and_update(&mut instance).await {
                Ok(_) => return Ok(()),
                Err(e)
                    if e.is_concurrent_update() && conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn dispatch(
        &self,
        definition: &SagaDefinition,
        instance: &SagaInstance,
        step_index: usize,
        direction: Direction,
        attempt: u32,
    ) -> Result<()> {
        let step = &definition.steps[step_index];
        let Some(command) = step.command(direction) else {
            tracing::warn!(saga_id = %instance.saga_id, step = %step.name, %direction, "step has no command for direction");
            return Ok(());
        };

        let envelope = CommandEnvelope {
            saga_id: instance.saga_id,
            step_name: step.name.clone(),
            participant: command.participant.clone(),
            action: command.action.clone(),
            direction,
            attempt,
            payload: command_payload(instance),
        };
        if !self.guard.begin(&envelope.idempotency_key()).await? {
            return Ok(());
        }

        self.gateway.dispatch(envelope).await?;
        metrics::counter!("saga_commands_dispatched_total", "direction" => direction.as_str())
            .increment(1);
        tracing::info!(
            saga_id = %instance.saga_id,
            step = %step.name,
            participant = %command.participant,
            %direction,
            attempt,
            "command dispatched"
        );
        Ok(())
    }

    async fn settle(&self, key: &IdempotencyKey, outcome: DispatchOutcome) {
        if let Err(e) = self.guard.complete(key, outcome).await {
            tracing::warn!(%key, error = %e, "failed to record dispatch outcome");
        }
    }
}

fn not_found(error: StateStoreError) -> SagaError {
    match error {
        StateStoreError::NotFound(saga_id) => SagaError::NotFound(saga_id),
        other => other.into(),
    }
}

/// Builds the payload sent with every command: the saga input plus the
/// results of the steps that succeeded so far.
fn command_payload(instance: &SagaInstance) -> Value {
    let results: Map<String, Value> = instance
        .step_results
        .iter()
        .filter_map(|step| {
            step.result
                .clone()
                .map(|result| (step.step_name.clone(), result))
        })
        .collect();

    serde_json::json!({
        "input": instance.payload,
        "results": results,
    })
}

/// The dispatch an input reports on, with its outcome.
fn settled_key(instance: &SagaInstance, input: &Input) -> Option<(IdempotencyKey, DispatchOutcome)> {
    let key = |step_name: &str, direction, attempt| {
        IdempotencyKey::new(instance.saga_id, step_name, direction, attempt)
    };

    match input {
        Input::StepSucceeded { step_name, .. } => instance.step(step_name).map(|step| {
            (
                key(step_name, Direction::Forward, step.attempts),
                DispatchOutcome::Succeeded,
            )
        }),
        Input::StepFailed { step_name, .. } => instance.step(step_name).map(|step| {
            (
                key(step_name, Direction::Forward, step.attempts),
                DispatchOutcome::Failed,
            )
        }),
        Input::CompensationSucceeded { step_name } => instance.step(step_name).map(|step| {
            (
                key(step_name, Direction::Compensate, step.compensation_attempts),
                DispatchOutcome::Succeeded,
            )
        }),
        Input::CompensationFailed { step_name, .. } => instance.step(step_name).map(|step| {
            (
                key(step_name, Direction::Compensate, step.compensation_attempts),
                DispatchOutcome::Failed,
            )
        }),
        Input::Expire { .. } => {
            let step = instance.current_step()?;
            match instance.status {
                SagaStatus::Running => Some((
                    key(&step.step_name, Direction::Forward, step.attempts),
                    DispatchOutcome::Failed,
                )),
                SagaStatus::Compensating => Some((
                    key(&step.step_name, Direction::Compensate, step.compensation_attempts),
                    DispatchOutcome::Failed,
                )),
                _ => None,
            }
        }
        Input::Start | Input::Resume => None,
    }
}

fn log_ignored(instance: &SagaInstance, reason: &Ignored) {
    match reason {
        Ignored::LateSuccess { step_name } => {
            metrics::counter!("saga_late_successes_total").increment(1);
            tracing::warn!(
                saga_id = %instance.saga_id,
                step = %step_name,
                "success arrived after the step was given up; compensation continues"
            );
        }
        Ignored::UnknownAttempt {
            step_name,
            attempt,
            current,
        } => {
            metrics::counter!("saga_unknown_attempts_total").increment(1);
            tracing::warn!(
                saga_id = %instance.saga_id,
                step = %step_name,
                attempt,
                current,
                "failure reported for an attempt that was never dispatched"
            );
        }
        reason if reason.is_duplicate() => {
            metrics::counter!("saga_duplicate_events_total").increment(1);
            tracing::debug!(saga_id = %instance.saga_id, ?reason, "duplicate input ignored");
        }
        reason => {
            tracing::debug!(saga_id = %instance.saga_id, ?reason, "input does not apply");
        }
    }
}

/// Emits logs and metrics for a status change.
fn observe(before: SagaStatus, instance: &SagaInstance) {
    if before == instance.status {
        return;
    }

    let saga_id = instance.saga_id;
    match instance.status {
        SagaStatus::Compensating => {
            metrics::counter!("saga_compensations_started_total").increment(1);
            tracing::warn!(
                %saga_id,
                reason = instance.failure_reason.as_deref().unwrap_or("unknown"),
                "saga compensating"
            );
        }
        SagaStatus::Completed => {
            metrics::counter!("saga_completed_total").increment(1);
            tracing::info!(%saga_id, "saga completed");
        }
        SagaStatus::Compensated => {
            metrics::counter!("saga_compensated_total").increment(1);
            tracing::info!(%saga_id, "saga compensated");
        }
        SagaStatus::Failed => {
            metrics::counter!("saga_failed_total").increment(1);
            tracing::error!(
                %saga_id,
                reason = instance.failure_reason.as_deref().unwrap_or("unknown"),
                "saga failed"
            );
        }
        SagaStatus::Running => {}
    }

    if instance.status.is_terminal() {
        let duration = (instance.updated_at - instance.created_at).num_milliseconds() as f64 / 1000.0;
        metrics::histogram!("saga_duration_seconds").record(duration);
    }
}
