use std::pin::Pin;

use async_trait::async_trait;
use common::SagaId;
use futures_core::Stream;

use crate::{
    DispatchOutcome, IdempotencyKey, IdempotencyRecord, InstanceQuery, Result, SagaInstance,
    StateStoreError, Version,
};

/// A stream of saga instances.
pub type InstanceStream = Pin<Box<dyn Stream<Item = Result<SagaInstance>> + Send>>;

/// Durable storage for saga instances.
///
/// All implementations must be thread-safe (Send + Sync) and must serialize
/// writers to the same saga through a version check.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saves an instance atomically.
    ///
    /// `instance.version` is the version the writer loaded: `Version::initial()`
    /// for an instance that must not exist yet. If the stored version differs,
    /// the write fails with `ConcurrentUpdate` and nothing is written.
    ///
    /// Returns the new version of the record.
    async fn save(&self, instance: &SagaInstance) -> Result<Version>;

    /// Retrieves an instance by ID, if it exists.
    async fn find(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Streams every instance whose status is `Running` or `Compensating`.
    async fn list_in_flight(&self) -> Result<InstanceStream>;

    /// Retrieves instances matching a query.
    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>>;
}

/// Extension trait providing convenience methods for state stores.
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Retrieves an instance by ID, failing with `NotFound` if absent.
    async fn load(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.find(saga_id)
            .await?
            .ok_or(StateStoreError::NotFound(saga_id))
    }

    /// Saves an instance and stores the new version back into it.
    async fn save_and_update(&self, instance: &mut SagaInstance) -> Result<Version> {
        let version = self.save(&*instance).await?;
        instance.version = version;
        Ok(version)
    }
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Storage for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims a key for dispatch.
    ///
    /// Inserts a `Dispatched` record and returns true if the key is new. An
    /// existing record still in `Dispatched` state whose dispatch time is older
    /// than `window` is re-armed (its dispatch time reset) and also returns
    /// true. Any other existing record returns false.
    async fn try_claim(&self, key: &IdempotencyKey, window: chrono::Duration) -> Result<bool>;

    /// Records the last known outcome of a dispatched key.
    ///
    /// Creates the record if the dispatch itself was never recorded.
    async fn record_outcome(&self, key: &IdempotencyKey, outcome: DispatchOutcome) -> Result<()>;

    /// Retrieves the record for a key.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;
}

/// Checks the expected version of a write against the stored one.
pub(crate) fn check_version(
    saga_id: SagaId,
    expected: Version,
    stored: Option<Version>,
) -> Result<()> {
    let actual = stored.unwrap_or(Version::initial());
    if actual != expected {
        return Err(StateStoreError::ConcurrentUpdate {
            saga_id,
            expected,
            actual,
        });
    }
    Ok(())
}
