// src/api/error.rs

//! API error type and HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::errors::ChainwatchError;

pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_UNAVAILABLE", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<ChainwatchError> for ApiError {
    fn from(err: ChainwatchError) -> Self {
        let message = err.to_string();
        match err {
            ChainwatchError::TaskNotFound(_) | ChainwatchError::RunNotFound(_) => {
                Self::not_found(message)
            }
            ChainwatchError::InvalidState(_) => {
                Self::new(StatusCode::CONFLICT, "INVALID_STATE", message)
            }
            ChainwatchError::AlreadyRunning(_) => {
                Self::new(StatusCode::CONFLICT, "ALREADY_RUNNING", message)
            }
            ChainwatchError::UpstreamUnavailable(_) => Self::bad_gateway(message),
            ChainwatchError::Validation(_) | ChainwatchError::ConfigError(_) => {
                Self::bad_request(message)
            }
            other => {
                error!(error = %other, "request failed");
                Self::internal("internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
