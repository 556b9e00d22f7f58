//! HTTP API server for the saga orchestrator.
//!
//! Provides REST endpoints for starting and inspecting sagas and for
//! accepting participant replies, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    DefinitionRegistry, EventRouter, GatewayConfig, InMemoryParticipants, SagaEngine,
    TracingAlertSink, TransportGateway, WorkerPool, trip_booking,
};
use state_store::{IdempotencyStore, StateStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Capacity of each worker shard's event queue.
const SHARD_QUEUE_CAPACITY: usize = 1024;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, I>(state: Arc<AppState<S, I>>, metrics_handle: PrometheusHandle) -> Router
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, I>))
        .route("/sagas", post(routes::sagas::start::<S, I>))
        .route("/sagas", get(routes::sagas::list::<S, I>))
        .route("/sagas/events", post(routes::sagas::event::<S, I>))
        .route("/sagas/{id}", get(routes::sagas::get::<S, I>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the engine, simulated participants and worker pool over the given stores.
///
/// Registers the trip booking definition. Must be called from within a tokio
/// runtime, since the worker pool is spawned immediately.
pub fn create_default_state<S, I>(
    store: S,
    idempotency: I,
    config: &Config,
) -> (Arc<AppState<S, I>>, WorkerPool)
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let mut definitions = DefinitionRegistry::new();
    if let Err(e) = definitions.register(trip_booking::definition()) {
        tracing::error!(error = %e, "built-in trip booking definition rejected");
    }

    let (events, receivers) = EventRouter::new(config.worker_shards, SHARD_QUEUE_CAPACITY);
    let participants = InMemoryParticipants::new(events.clone());
    let gateway = TransportGateway::new(
        Arc::new(participants.clone()),
        events.clone(),
        GatewayConfig::default(),
    );

    let engine = Arc::new(SagaEngine::new(
        store,
        idempotency,
        gateway,
        Arc::new(definitions),
        Arc::new(TracingAlertSink),
        config.engine_config(),
    ));
    let workers = WorkerPool::spawn(engine.clone(), receivers);

    let state = Arc::new(AppState {
        engine,
        events,
        participants,
    });
    (state, workers)
}
