//! Durable storage for saga instances and dispatch idempotency records.
//!
//! Provides the `StateStore` and `IdempotencyStore` traits with an in-memory
//! implementation for tests and single-process use, and a PostgreSQL
//! implementation with optimistic concurrency on the instance version.

pub mod error;
pub mod idempotency;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;
pub mod version;

pub use common::SagaId;
pub use error::{Result, StateStoreError};
pub use idempotency::{DispatchOutcome, Direction, IdempotencyKey, IdempotencyRecord};
pub use instance::{SagaInstance, SagaStatus, StepOutcome, StepResult};
pub use memory::{InMemoryIdempotencyStore, InMemoryStateStore};
pub use postgres::{PostgresIdempotencyStore, PostgresStateStore};
pub use query::InstanceQuery;
pub use store::{IdempotencyStore, InstanceStream, StateStore, StateStoreExt};
pub use version::Version;
