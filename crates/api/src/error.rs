//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use state_store::StateStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Saga engine error.
    #[error(transparent)]
    Saga(#[from] SagaError),
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::DefinitionNotFound(_) | SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::StateStore(StateStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        SagaError::InvalidPayload(_) | SagaError::UnknownStep { .. } => StatusCode::BAD_REQUEST,
        SagaError::StateStore(StateStoreError::ConcurrentUpdate { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "saga engine error");
    }
    (status, err.to_string())
}
