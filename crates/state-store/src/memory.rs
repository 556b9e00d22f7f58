use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::SagaId;
use tokio::sync::RwLock;

use crate::{
    DispatchOutcome, IdempotencyKey, IdempotencyRecord, InstanceQuery, Result, SagaInstance,
    Version,
    store::{IdempotencyStore, InstanceStream, StateStore, check_version},
};

/// In-memory state store implementation for testing and single-process use.
///
/// Provides the same interface and version semantics as the PostgreSQL
/// implementation. Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
}

impl InMemoryStateStore {
    /// Creates a new empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of instances stored.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Clears all instances.
    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, instance: &SagaInstance) -> Result<Version> {
        let mut store = self.instances.write().await;

        let stored = store.get(&instance.saga_id).map(|i| i.version);
        if let Err(e) = check_version(instance.saga_id, instance.version, stored) {
            metrics::counter!("state_store_conflicts_total").increment(1);
            tracing::debug!(saga_id = %instance.saga_id, error = %e, "rejected stale write");
            return Err(e);
        }

        let mut record = instance.clone();
        record.version = instance.version.next();
        let version = record.version;
        store.insert(record.saga_id, record);

        Ok(version)
    }

    async fn find(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let store = self.instances.read().await;
        Ok(store.get(&saga_id).cloned())
    }

    async fn list_in_flight(&self) -> Result<InstanceStream> {
        use futures_util::stream;

        let instances = self.query(InstanceQuery::in_flight()).await?;
        let stream = stream::iter(instances.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let store = self.instances.read().await;
        let mut instances: Vec<_> = store
            .values()
            .filter(|instance| query.matches(instance))
            .cloned()
            .collect();

        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.saga_id.cmp(&b.saga_id))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(instances.into_iter().skip(offset).take(limit).collect())
    }
}

/// In-memory idempotency store.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates a new empty in-memory idempotency store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records stored.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_claim(&self, key: &IdempotencyKey, window: chrono::Duration) -> Result<bool> {
        let mut records = self.records.write().await;
        let now = Utc::now();

        match records.get_mut(key) {
            None => {
                records.insert(key.clone(), IdempotencyRecord::dispatched(key.clone()));
                Ok(true)
            }
            Some(record) if !record.blocks_resend(now, window) => {
                record.dispatched_at = now;
                record.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn record_outcome(&self, key: &IdempotencyKey, outcome: DispatchOutcome) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| IdempotencyRecord::dispatched(key.clone()));
        record.outcome = outcome;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let records = self.records.read().await;
        Ok(records.get(key).cloned())
    }
}
