//! Error types for the model layer and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by model variants.
///
/// Variants carry string payloads rather than source errors so the type
/// stays `Clone` and can be stored alongside registry entries.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("hub operation failed for '{model_id}': {message}")]
    Hub { model_id: String, message: String },

    #[error("no weights file found in snapshot for '{model_id}'")]
    WeightsNotFound { model_id: String },

    #[error("model '{model_id}' is not attached to a runtime")]
    NotAttached { model_id: String },

    #[error("request to runtime failed: {0}")]
    Request(String),

    #[error("runtime returned error status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("failed to decode runtime response: {0}")]
    Decode(String),

    #[error("unknown model kind: {0}")]
    UnknownKind(String),
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::NotAttached { .. } => ApiError::Conflict(err.to_string()),
            LlmError::Request(_) | LlmError::Backend { .. } | LlmError::Decode(_) => {
                ApiError::BadGateway(err.to_string())
            }
            LlmError::UnknownKind(_) => ApiError::BadRequest(err.to_string()),
            LlmError::Hub { .. } | LlmError::WeightsNotFound { .. } => {
                ApiError::Internal(anyhow::Error::new(err))
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
