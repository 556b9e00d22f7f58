//! Restart recovery and the periodic sweep for stuck sagas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use state_store::{IdempotencyStore, InstanceQuery, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RecoveryConfig;
use crate::engine::SagaEngine;
use crate::error::Result;
use crate::gateway::ParticipantGateway;

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances whose outstanding command was re-issued or re-armed.
    pub resumed: usize,
    /// Instances that turned out to need nothing.
    pub skipped: usize,
    /// Instances that could not be resumed.
    pub failed: usize,
    /// `FAILED` instances whose operator alert was raised by this pass.
    pub alerts_raised: usize,
}

/// Outcome of a stuck-saga sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

/// Resumes in-flight sagas after a restart and expires the ones that stall.
pub struct RecoveryManager<S, I, G>
where
    S: StateStore,
    I: IdempotencyStore,
    G: ParticipantGateway,
{
    engine: Arc<SagaEngine<S, I, G>>,
    config: RecoveryConfig,
}

impl<S, I, G> RecoveryManager<S, I, G>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
    G: ParticipantGateway + 'static,
{
    pub fn new(engine: Arc<SagaEngine<S, I, G>>, config: RecoveryConfig) -> Self {
        Self { engine, config }
    }

    /// Resumes every `RUNNING` or `COMPENSATING` instance in the store and
    /// raises the alerts of `FAILED` instances that never delivered theirs.
    ///
    /// One bad instance does not stop the pass; its error is logged and
    /// counted in the report.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut instances = self.engine.store().list_in_flight().await?;

        while let Some(instance) = instances.next().await {
            let instance = match instance {
                Ok(instance) => instance,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, "could not read instance during recovery");
                    continue;
                }
            };

            let saga_id = instance.saga_id;
            match self.engine.resume(saga_id).await {
                Ok(status) if status.is_in_flight() => {
                    report.resumed += 1;
                    metrics::counter!("saga_recovered_total").increment(1);
                    tracing::debug!(%saga_id, %status, "saga resumed");
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(%saga_id, error = %e, "failed to resume saga");
                }
            }
        }

        for instance in self.engine.query(InstanceQuery::undelivered_alerts()).await? {
            let saga_id = instance.saga_id;
            match self.engine.redeliver_alert(saga_id).await {
                Ok(true) => report.alerts_raised += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(%saga_id, error = %e, "failed to redeliver operator alert");
                }
            }
        }

        tracing::info!(
            resumed = report.resumed,
            skipped = report.skipped,
            failed = report.failed,
            alerts_raised = report.alerts_raised,
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Expires in-flight instances untouched for longer than the stuck timeout.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let timeout = chrono::Duration::from_std(self.config.stuck_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stuck = self
            .engine
            .query(InstanceQuery::in_flight().updated_before(cutoff))
            .await?;

        let mut report = SweepReport::default();
        for instance in stuck {
            let saga_id = instance.saga_id;
            match self.engine.expire_stale(saga_id, cutoff).await {
                Ok(status) => {
                    report.expired += 1;
                    metrics::counter!("saga_expired_total").increment(1);
                    tracing::warn!(%saga_id, %status, "stuck saga expired");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(%saga_id, error = %e, "failed to expire stuck saga");
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            tracing::info!(expired = report.expired, failed = report.failed, "sweep finished");
        }
        Ok(report)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "stuck-saga sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("recovery sweeper stopped");
        })
    }
}
