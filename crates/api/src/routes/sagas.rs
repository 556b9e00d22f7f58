//! Saga start, query and participant event endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{EventRouter, InMemoryParticipants, ParticipantEvent, SagaEngine, TransportGateway};
use serde::{Deserialize, Serialize};
use state_store::{
    IdempotencyStore, InstanceQuery, SagaInstance, SagaStatus, StateStore, StepResult,
};

use crate::error::ApiError;

/// Default page size of `GET /sagas`.
const DEFAULT_LIMIT: usize = 100;

/// The engine type served by the API: commands go to the simulated participants.
pub type Engine<S, I> = SagaEngine<S, I, TransportGateway<InMemoryParticipants>>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: StateStore, I: IdempotencyStore> {
    pub engine: Arc<Engine<S, I>>,
    pub events: EventRouter,
    pub participants: InMemoryParticipants,
}

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub definition_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Deserialize)]
pub struct ListSagasParams {
    pub status: Option<String>,
    pub definition_name: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStartedResponse {
    pub saga_id: String,
    pub status: SagaStatus,
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub definition_name: String,
    pub status: SagaStatus,
    pub current_index: usize,
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub alert_pending: bool,
    pub step_results: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<SagaInstance> for SagaResponse {
    fn from(instance: SagaInstance) -> Self {
        Self {
            saga_id: instance.saga_id.to_string(),
            definition_name: instance.definition_name,
            status: instance.status,
            current_index: instance.current_index,
            payload: instance.payload,
            failure_reason: instance.failure_reason,
            alert_pending: instance.alert_pending,
            step_results: instance.step_results,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            version: instance.version.as_i64(),
        }
    }
}

#[derive(Serialize)]
pub struct EventAcceptedResponse {
    pub saga_id: String,
    pub step_name: String,
}

// -- Handlers --

/// POST /sagas: start a saga; the outcome is observed through `GET /sagas/{id}`.
#[tracing::instrument(skip(state, req), fields(definition = %req.definition_name))]
pub async fn start<S, I>(
    State(state): State<Arc<AppState<S, I>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let saga_id = state
        .engine
        .start(&req.definition_name, req.payload)
        .await?;

    let response = SagaStartedResponse {
        saga_id: saga_id.to_string(),
        status: SagaStatus::Running,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /sagas/{id}: load a saga instance.
#[tracing::instrument(skip(state))]
pub async fn get<S, I>(
    State(state): State<Arc<AppState<S, I>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let instance = state.engine.get(saga_id).await?;
    Ok(Json(instance.into()))
}

/// GET /sagas: list instances, optionally filtered by status and definition.
#[tracing::instrument(skip(state, params))]
pub async fn list<S, I>(
    State(state): State<Arc<AppState<S, I>>>,
    Query(params): Query<ListSagasParams>,
) -> Result<Json<Vec<SagaResponse>>, ApiError>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let mut query = InstanceQuery::new()
        .limit(params.limit.unwrap_or(DEFAULT_LIMIT))
        .offset(params.offset.unwrap_or(0));
    if let Some(status) = params.status.as_deref() {
        let status = status.parse::<SagaStatus>().map_err(ApiError::BadRequest)?;
        query = query.status(status);
    }
    if let Some(name) = params.definition_name {
        query = query.definition_name(name);
    }

    let instances = state.engine.query(query).await?;
    Ok(Json(instances.into_iter().map(SagaResponse::from).collect()))
}

/// POST /sagas/events: accept a participant reply for asynchronous processing.
#[tracing::instrument(
    skip(state, event),
    fields(saga_id = %event.saga_id, step = %event.step_name)
)]
pub async fn event<S, I>(
    State(state): State<Arc<AppState<S, I>>>,
    Json(event): Json<ParticipantEvent>,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), ApiError>
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    // Reject replies for sagas this orchestrator never started
    state.engine.get(event.saga_id).await?;

    let response = EventAcceptedResponse {
        saga_id: event.saga_id.to_string(),
        step_name: event.step_name.clone(),
    };
    state.events.route(event).await?;
    metrics::counter!("api_participant_events_total").increment(1);

    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
