//! Error taxonomy shared across the HTTP surface.
//!
//! Domain modules keep their own error enums; everything is folded into
//! [`ApiError`] at the handler boundary so each failure kind maps to exactly
//! one status code and one JSON body shape.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller-correctable request problems: bad JSON, unknown fields,
    /// out-of-range parameters, empty prompt.
    #[error("{0}")]
    Validation(String),

    /// Every authentication failure collapses into the same opaque message;
    /// callers can never distinguish unknown user from wrong password.
    #[error("invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    /// Queue at capacity; carries the hint surfaced as `Retry-After`.
    #[error("queue full, retry later")]
    QueueFull { retry_after_seconds: u64 },

    /// Upstream engine unreachable and mock fallback disabled.
    #[error("{0}")]
    Upstream(String),

    /// Bugs: stale transitions, invariant violations. Logged with the full
    /// source chain, reported to the caller without detail.
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref source) = self {
            error!(error = ?source, "internal error while handling request");
        }

        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));

        match self {
            Self::QueueFull {
                retry_after_seconds,
            } => (
                status,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}
