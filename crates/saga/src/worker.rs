//! Sharded event routing and the worker pool that drains it.
//!
//! Every event of one saga hashes to the same shard and each shard is drained
//! by a single task, so events of an instance are applied in channel order
//! while different instances proceed concurrently.

use std::sync::Arc;

use state_store::{IdempotencyStore, StateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::engine::SagaEngine;
use crate::error::{Result, SagaError};
use crate::events::ParticipantEvent;
use crate::gateway::ParticipantGateway;

/// Routes inbound participant events to per-shard queues.
#[derive(Debug, Clone)]
pub struct EventRouter {
    senders: Arc<Vec<mpsc::Sender<ParticipantEvent>>>,
}

impl EventRouter {
    /// Creates a router with `shards` bounded queues of `capacity` events each.
    ///
    /// Returns the receivers to hand to [`WorkerPool::spawn`].
    pub fn new(shards: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<ParticipantEvent>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        let router = Self {
            senders: Arc::new(senders),
        };
        (router, receivers)
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Enqueues an event on its saga's shard, waiting for room if the queue is full.
    pub async fn route(&self, event: ParticipantEvent) -> Result<()> {
        let shard = event.saga_id.shard(self.senders.len());
        self.senders[shard]
            .send(event)
            .await
            .map_err(|_| SagaError::ChannelClosed)?;
        metrics::counter!("saga_events_routed_total").increment(1);
        Ok(())
    }
}

/// One task per shard applying events through the engine.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawns one worker per receiver.
    pub fn spawn<S, I, G>(
        engine: Arc<SagaEngine<S, I, G>>,
        receivers: Vec<mpsc::Receiver<ParticipantEvent>>,
    ) -> Self
    where
        S: StateStore + 'static,
        I: IdempotencyStore + 'static,
        G: ParticipantGateway + 'static,
    {
        let (shutdown, stop) = watch::channel(false);
        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(shard, receiver)| {
                tokio::spawn(run_worker(shard, engine.clone(), receiver, stop.clone()))
            })
            .collect();

        tracing::info!(shards = handles.len(), "saga worker pool started");
        Self { handles, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops every worker and waits for them to finish the event in hand.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "saga worker panicked");
            }
        }
        tracing::info!("saga worker pool stopped");
    }
}

async fn run_worker<S, I, G>(
    shard: usize,
    engine: Arc<SagaEngine<S, I, G>>,
    mut receiver: mpsc::Receiver<ParticipantEvent>,
    mut stop: watch::Receiver<bool>,
) where
    S: StateStore,
    I: IdempotencyStore,
    G: ParticipantGateway,
{
    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let saga_id = event.saga_id;
        let step = event.step_name.clone();
        if let Err(e) = engine.handle_event(event).await {
            metrics::counter!("saga_event_errors_total").increment(1);
            tracing::error!(shard, %saga_id, %step, error = %e, "failed to apply participant event");
        }
    }
    tracing::debug!(shard, "saga worker exiting");
}
