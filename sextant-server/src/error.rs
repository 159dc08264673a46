//! Server error types with HTTP status code mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error type wrapping core and ingest errors with status mapping
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed client input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing resource (provider, multihash path)
    #[error("{0}")]
    NotFound(String),

    /// Announce rate limit exceeded
    #[error("too many requests")]
    RateLimited,

    /// Ingest pipeline error
    #[error(transparent)]
    Ingest(#[from] sextant_ingest::IngestError),

    /// Core storage or codec error
    #[error(transparent)]
    Core(#[from] sextant_core::Error),
}

impl ServerError {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServerError::BadRequest(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        ServerError::NotFound(msg.into())
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Core(sextant_core::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Core(sextant_core::Error::Frozen) => StatusCode::SERVICE_UNAVAILABLE,
            // Internal errors are opaque to clients.
            ServerError::Ingest(_) | ServerError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// HTTP status code
    pub status: u16,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Never leak internal details on server errors.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal server error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: message,
            status: status.as_u16(),
        };
        let json = serde_json::to_string(&body)
            .unwrap_or_else(|_| format!(r#"{{"error":"error","status":{}}}"#, status.as_u16()));

        (status, [("content-type", "application/json")], json).into_response()
    }
}
