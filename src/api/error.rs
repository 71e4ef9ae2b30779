//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::triage::{RuleConfigError, SubmitError, TriageError};

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Stale rules: {0}")]
    StaleRules(String),
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail),
            ApiError::InvalidTransition(detail) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", detail)
            }
            ApiError::StaleRules(detail) => (StatusCode::CONFLICT, "STALE_RULES", detail),
            ApiError::MalformedSignal(detail) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "MALFORMED_SIGNAL", detail)
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

impl From<TriageError> for ApiError {
    fn from(err: TriageError) -> Self {
        match err {
            TriageError::AlertNotFound(id) => ApiError::NotFound(format!("Alert not found: {id}")),
            e @ (TriageError::InvalidTransition { .. } | TriageError::AlertClosed { .. }) => {
                ApiError::InvalidTransition(e.to_string())
            }
            TriageError::Evaluation(e) => ApiError::MalformedSignal(e.to_string()),
            TriageError::Rules(e) => e.into(),
            e @ (TriageError::Database(_) | TriageError::LockPoisoned) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Malformed(e) => ApiError::MalformedSignal(e.to_string()),
            SubmitError::Triage(e) => e.into(),
        }
    }
}

impl From<RuleConfigError> for ApiError {
    fn from(err: RuleConfigError) -> Self {
        match err {
            e @ RuleConfigError::StaleVersion { .. } => ApiError::StaleRules(e.to_string()),
            e @ RuleConfigError::Io { .. } => ApiError::Internal(e.to_string()),
            e => ApiError::BadRequest(e.to_string()),
        }
    }
}
