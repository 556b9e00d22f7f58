//! Idempotency guard around command dispatch.

use std::time::Duration;

use state_store::{DispatchOutcome, IdempotencyKey, IdempotencyStore};

use crate::error::Result;

/// Check-and-set protection against sending the same attempt twice.
///
/// A recovery pass racing a live retry claims the same key; only the first
/// claim within the dispatch window is allowed to send.
pub struct IdempotencyGuard<I: IdempotencyStore> {
    store: I,
    window: chrono::Duration,
}

impl<I: IdempotencyStore> IdempotencyGuard<I> {
    pub fn new(store: I, window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        Self { store, window }
    }

    /// Claims `key` for dispatch. Returns false if the send must be skipped.
    pub async fn begin(&self, key: &IdempotencyKey) -> Result<bool> {
        let claimed = self.store.try_claim(key, self.window).await?;
        if !claimed {
            metrics::counter!("saga_dispatches_suppressed_total").increment(1);
            tracing::debug!(%key, "dispatch already in progress, skipping resend");
        }
        Ok(claimed)
    }

    /// Records the outcome of a dispatched key once its reply is processed.
    pub async fn complete(&self, key: &IdempotencyKey, outcome: DispatchOutcome) -> Result<()> {
        self.store.record_outcome(key, outcome).await?;
        Ok(())
    }

    pub fn store(&self) -> &I {
        &self.store
    }
}
