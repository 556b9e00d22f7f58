//! Simulated participant services.
//!
//! [`InMemoryParticipants`] stands in for the real flight, hotel and payment
//! services: it records every command it receives and answers asynchronously
//! through the [`EventRouter`], the way a remote service would answer on a
//! reply queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::SagaId;
use state_store::Direction;

use crate::events::{CommandEnvelope, FailureKind, ParticipantEvent};
use crate::gateway::{Transport, TransportError};
use crate::worker::EventRouter;

/// Scripted reaction of a simulated participant to one action.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Reply with success.
    #[default]
    Succeed,
    /// Reply with a business failure.
    Reject(String),
    /// Reply with a transient failure the first `n` times per saga, then succeed.
    FailTransiently(u32),
    /// Refuse the connection the first `n` sends per saga, then succeed.
    Unavailable(u32),
    /// Accept the command and never reply.
    Silent,
}

#[derive(Debug, Default)]
struct ParticipantsState {
    behaviors: HashMap<(String, String), Behavior>,
    seen: HashMap<(SagaId, String, String), u32>,
    delivered: Vec<CommandEnvelope>,
    next_reference: u32,
}

/// In-memory participants for tests and the demo server.
#[derive(Debug, Clone)]
pub struct InMemoryParticipants {
    state: Arc<Mutex<ParticipantsState>>,
    replies: EventRouter,
}

impl InMemoryParticipants {
    /// Creates participants that answer every command with success.
    pub fn new(replies: EventRouter) -> Self {
        Self {
            state: Arc::new(Mutex::new(ParticipantsState::default())),
            replies,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ParticipantsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts how `participant` reacts to `action`.
    pub fn set_behavior(
        &self,
        participant: impl Into<String>,
        action: impl Into<String>,
        behavior: Behavior,
    ) {
        self.lock()
            .behaviors
            .insert((participant.into(), action.into()), behavior);
    }

    /// Returns every command that reached a participant, oldest first.
    pub fn delivered(&self) -> Vec<CommandEnvelope> {
        self.lock().delivered.clone()
    }

    /// Returns the delivered commands of one saga as `step(fwd)` / `step(undo)` labels.
    pub fn dispatch_log(&self, saga_id: SagaId) -> Vec<String> {
        self.lock()
            .delivered
            .iter()
            .filter(|c| c.saga_id == saga_id)
            .map(|c| match c.direction {
                Direction::Forward => format!("{}(fwd)", c.step_name),
                Direction::Compensate => format!("{}(undo)", c.step_name),
            })
            .collect()
    }

    /// Returns the number of commands delivered for one saga.
    pub fn delivered_count(&self, saga_id: SagaId) -> usize {
        self.lock()
            .delivered
            .iter()
            .filter(|c| c.saga_id == saga_id)
            .count()
    }

    /// Decides the reply to a command, recording it if it was accepted.
    fn react(
        &self,
        command: &CommandEnvelope,
    ) -> Result<Option<ParticipantEvent>, TransportError> {
        let mut state = self.lock();
        let behavior = state
            .behaviors
            .get(&(command.participant.clone(), command.action.clone()))
            .cloned()
            .unwrap_or_default();

        let seen = state
            .seen
            .entry((command.saga_id, command.participant.clone(), command.action.clone()))
            .or_insert(0);
        *seen += 1;
        let seen = *seen;

        if matches!(behavior, Behavior::Unavailable(n) if seen <= n) {
            return Err(TransportError::Unavailable(format!(
                "{} refused the connection",
                command.participant
            )));
        }

        state.delivered.push(command.clone());
        let reply = match behavior {
            Behavior::Silent => None,
            Behavior::Reject(reason) => Some(ParticipantEvent::failed(
                command,
                FailureKind::Business,
                reason,
            )),
            Behavior::FailTransiently(n) if seen <= n => Some(ParticipantEvent::failed(
                command,
                FailureKind::Transient,
                format!("{} timed out", command.participant),
            )),
            _ => {
                state.next_reference += 1;
                let reference = format!(
                    "{}-{:04}",
                    command.action.to_uppercase(),
                    state.next_reference
                );
                Some(ParticipantEvent::succeeded(
                    command,
                    serde_json::json!({ "reference": reference }),
                ))
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl Transport for InMemoryParticipants {
    async fn send(&self, command: &CommandEnvelope) -> Result<(), TransportError> {
        let Some(reply) = self.react(command)? else {
            tracing::debug!(saga_id = %command.saga_id, step = %command.step_name, "participant stays silent");
            return Ok(());
        };

        let replies = self.replies.clone();
        tokio::spawn(async move {
            if let Err(e) = replies.route(reply).await {
                tracing::error!(error = %e, "participant reply dropped");
            }
        });
        Ok(())
    }
}
