//! Server errors and the HTTP error body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tether_core::RelayError;
use thiserror::Error;

/// Failures starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Other socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The global metrics recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    /// Relay startup failed.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Convenience alias.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// HTTP status for a relay error.
pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        RelayError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
        RelayError::NotConnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A relay error rendered as `{success:false, error, code}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: RelayError,
}

impl ApiError {
    /// Override the mapped status.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Status the response will carry.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        Self {
            status: status_for(&error),
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.error.to_string(),
            "code": self.error.kind().as_str(),
        });
        (self.status, Json(body)).into_response()
    }
}
