//! Error types and HTTP response conversion
//!
//! The pipeline surfaces four error kinds to callers: `invalid-input` (400),
//! `unauthorized` (401), `not-found` (404) and `storage` (500). Infrastructure
//! failures (key-value store, row store, pub/sub) all collapse into the
//! `storage` kind at the API boundary; the original error is logged with its
//! context before it is flattened.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the pipeline error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the activity pipeline
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// Row store error
    #[error("Row store error: {0}")]
    Database(Box<sqlx::Error>),

    /// NATS error
    #[error("NATS error: {0}")]
    Nats(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed seed, unknown format, malformed frame, invalid id shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or failing authorization, invalid or expired signature
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown stream type or unknown resource on read
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store failure after retries were exhausted
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl Error {
    /// The numeric code propagated to HTTP status and WebSocket error frames
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Stable kind label used in logs and error envelopes
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid-input",
            Error::Unauthorized(_) => "unauthorized",
            Error::NotFound(_) => "not-found",
            _ => "storage",
        }
    }
}

/// Error envelope returned to HTTP callers and embedded in WebSocket
/// responses as `error`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric error code (mirrors the HTTP status)
    pub code: u16,

    /// Human-readable message
    pub msg: String,
}

impl ErrorResponse {
    /// Create a new error envelope
    #[must_use]
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.msg)
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidInput(msg) | Error::Unauthorized(msg) | Error::NotFound(msg) => {
                Self::new(err.code(), msg.clone())
            }
            // Infrastructure details stay in the logs
            _ => Self::new(err.code(), "Storage failure"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::InvalidInput(_) | Error::Unauthorized(_) | Error::NotFound(_) => {}
            other => {
                tracing::error!(kind = other.kind(), "Request failed: {}", other);
            }
        }

        let body = ErrorResponse::from(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("Serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidInput("bad seed".into()).code(), 400);
        assert_eq!(Error::Unauthorized("no signature".into()).code(), 401);
        assert_eq!(Error::NotFound("no such stream".into()).code(), 404);
        assert_eq!(Error::Storage("redis down".into()).code(), 500);
        assert_eq!(Error::Nats("disconnected".into()).code(), 500);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), "invalid-input");
        assert_eq!(Error::Unauthorized("x".into()).kind(), "unauthorized");
        assert_eq!(Error::NotFound("x".into()).kind(), "not-found");
        assert_eq!(Error::Storage("x".into()).kind(), "storage");
    }

    #[test]
    fn test_storage_errors_are_flattened() {
        let envelope = ErrorResponse::from(&Error::Storage("connection refused".into()));
        assert_eq!(envelope.code, 500);
        assert_eq!(envelope.msg, "Storage failure");
    }

    #[test]
    fn test_caller_errors_keep_their_message() {
        let envelope = ErrorResponse::from(&Error::InvalidInput("missing verb".into()));
        assert_eq!(envelope.code, 400);
        assert_eq!(envelope.msg, "missing verb");
    }
}
