//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use state_store::{IdempotencyStore, StateStore};

use super::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub definitions: Vec<String>,
    pub worker_shards: usize,
}

/// GET /health: reports the registered saga definitions and shard count.
pub async fn check<S, I>(State(state): State<Arc<AppState<S, I>>>) -> Json<HealthResponse>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let mut definitions: Vec<String> = state
        .engine
        .definitions()
        .names()
        .map(str::to_string)
        .collect();
    definitions.sort();

    Json(HealthResponse {
        status: "ok",
        definitions,
        worker_shards: state.events.shard_count(),
    })
}
