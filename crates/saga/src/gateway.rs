//! Participant gateway: fire-and-forget delivery of step commands.
//!
//! The engine hands a [`CommandEnvelope`] to a [`ParticipantGateway`] and
//! returns immediately. Whatever happens afterwards, including delivery
//! failures, comes back as a [`ParticipantEvent`] through the [`EventRouter`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::events::{CommandEnvelope, FailureKind, ParticipantEvent};
use crate::worker::EventRouter;

/// Errors a transport can report when sending a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The participant could not be reached; the send may be retried.
    #[error("participant unavailable: {0}")]
    Unavailable(String),

    /// The participant refused the command outright.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Delivers commands to participants (HTTP, queue, ...).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, command: &CommandEnvelope) -> std::result::Result<(), TransportError>;
}

/// Sends step commands to participants.
#[async_trait]
pub trait ParticipantGateway: Send + Sync {
    /// Starts delivery of a command. The outcome arrives later as an event.
    async fn dispatch(&self, command: CommandEnvelope) -> Result<()>;
}

/// Gateway that delivers through a [`Transport`] on a background task.
pub struct TransportGateway<T: Transport> {
    transport: Arc<T>,
    events: EventRouter,
    config: GatewayConfig,
}

impl<T: Transport> TransportGateway<T> {
    pub fn new(transport: Arc<T>, events: EventRouter, config: GatewayConfig) -> Self {
        Self {
            transport,
            events,
            config,
        }
    }
}

#[async_trait]
impl<T: Transport> ParticipantGateway for TransportGateway<T> {
    async fn dispatch(&self, command: CommandEnvelope) -> Result<()> {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(deliver(transport, events, config, command));
        Ok(())
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        saga_id = %command.saga_id,
        step = %command.step_name,
        direction = %command.direction,
        attempt = command.attempt,
    )
)]
async fn deliver<T: Transport>(
    transport: Arc<T>,
    events: EventRouter,
    config: GatewayConfig,
    command: CommandEnvelope,
) {
    let delay = config.backoff.delay_for(command.attempt);
    if !delay.is_zero() {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off before resend");
        tokio::time::sleep(delay).await;
    }

    let mut retries = 0;
    let failure = loop {
        match transport.send(&command).await {
            Ok(()) => {
                metrics::counter!("saga_commands_delivered_total").increment(1);
                return;
            }
            Err(TransportError::Unavailable(message)) if retries < config.transport_retries => {
                retries += 1;
                metrics::counter!("saga_transport_retries_total").increment(1);
                tracing::warn!(retries, %message, "transport unavailable, retrying send");
                tokio::time::sleep(config.transport_retry_delay).await;
            }
            Err(TransportError::Unavailable(message)) => {
                break ParticipantEvent::failed(&command, FailureKind::Transient, message);
            }
            Err(TransportError::Rejected(message)) => {
                break ParticipantEvent::failed(&command, FailureKind::Business, message);
            }
        }
    };

    metrics::counter!("saga_delivery_failures_total").increment(1);
    tracing::warn!(participant = %command.participant, "command delivery failed");
    if let Err(e) = events.route(failure).await {
        tracing::error!(error = %e, "could not surface delivery failure");
    }
}

/// Gateway that only records commands, for driving the engine by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<CommandEnvelope>>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every dispatched command, oldest first.
    pub fn sent(&self) -> Vec<CommandEnvelope> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `step:direction#attempt` labels of every dispatched command.
    pub fn labels(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|c| format!("{}:{}#{}", c.step_name, c.direction, c.attempt))
            .collect()
    }

    pub fn last(&self) -> Option<CommandEnvelope> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl ParticipantGateway for RecordingGateway {
    async fn dispatch(&self, command: CommandEnvelope) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        Ok(())
    }
}
