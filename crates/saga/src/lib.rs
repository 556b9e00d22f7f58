//! Saga orchestration engine.
//!
//! A saga is a sequence of steps, each a command sent to a participant
//! service, where every completed step can be undone by a compensating
//! command. The engine drives each instance forward one step at a time and,
//! when a step fails for good, compensates the completed steps in reverse
//! order. Instance state is persisted through a [`state_store::StateStore`]
//! before any command leaves the process, so a restarted engine picks up
//! exactly where the old one stopped.
//!
//! The pieces:
//! - [`definition`]: saga definitions and the registry they are looked up in
//! - [`machine`]: the pure transition function over instances
//! - [`engine`]: load, transition, save, dispatch
//! - [`gateway`] and [`participants`]: fire-and-forget command delivery
//! - [`worker`]: sharded event routing, one ordered queue per shard
//! - [`recovery`]: restart recovery and the stuck-saga sweep
//! - [`trip_booking`]: the reference flight, hotel and payment saga

pub mod alert;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod guard;
pub mod machine;
pub mod participants;
pub mod recovery;
pub mod trip_booking;
pub mod worker;

pub use alert::{AlertSink, InMemoryAlertSink, OperatorAlert, TracingAlertSink};
pub use config::{BackoffPolicy, EngineConfig, GatewayConfig, RecoveryConfig, RetryLimits};
pub use definition::{DefinitionRegistry, SagaDefinition, StepCommand, StepDefinition};
pub use engine::SagaEngine;
pub use error::{Result, SagaError};
pub use events::{
    CommandEnvelope, EventError, EventOutcome, FailureKind, ParticipantEvent, StepFailure,
};
pub use gateway::{ParticipantGateway, RecordingGateway, Transport, TransportError, TransportGateway};
pub use guard::IdempotencyGuard;
pub use participants::{Behavior, InMemoryParticipants};
pub use recovery::{RecoveryManager, RecoveryReport, SweepReport};
pub use worker::{EventRouter, WorkerPool};
