use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ThrottlerMode;

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes carried over the wire so that remote failures keep their kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnexpectedThrottlerMode,
    NoSuchThrottler,
    NoSuchService,
    RequestQueueSizeLimitExceeded,
    Validation,
    Transport,
    Discovery,
    Config,
    Internal,
}

/// Same name the code has on the wire.
impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot handle {method} request in {mode} mode")]
    UnexpectedThrottlerMode { method: String, mode: ThrottlerMode },

    #[error("No such throttler {0:?}")]
    NoSuchThrottler(String),

    #[error("Service {service:?} is not registered for this realm")]
    NoSuchService { service: String },

    #[error("Request queue size limit exceeded: {limit}")]
    RequestQueueSizeLimitExceeded { limit: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unexpected_mode(method: &str, mode: ThrottlerMode) -> Self {
        Error::UnexpectedThrottlerMode {
            method: method.to_string(),
            mode,
        }
    }

    /// Kind of the failure, identical on both ends of an RPC.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnexpectedThrottlerMode { .. } => ErrorCode::UnexpectedThrottlerMode,
            Error::NoSuchThrottler(_) => ErrorCode::NoSuchThrottler,
            Error::NoSuchService { .. } => ErrorCode::NoSuchService,
            Error::RequestQueueSizeLimitExceeded { .. } => ErrorCode::RequestQueueSizeLimitExceeded,
            Error::Validation(_) => ErrorCode::Validation,
            Error::Transport(_) => ErrorCode::Transport,
            Error::Discovery(_) => ErrorCode::Discovery,
            Error::Config(_) => ErrorCode::Config,
            Error::Remote { code, .. } => *code,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::UnexpectedThrottlerMode => StatusCode::BAD_REQUEST,
            ErrorCode::NoSuchThrottler | ErrorCode::NoSuchService => StatusCode::NOT_FOUND,
            ErrorCode::RequestQueueSizeLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Transport | ErrorCode::Discovery => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Config | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Discovery(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Config(err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.code(),
            message: err.to_string(),
            code: err.status().as_u16(),
        }
    }

    pub fn into_error(self) -> Error {
        Error::Remote {
            code: self.error,
            message: self.message,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_code() {
        let err = Error::NoSuchThrottler("uploads".to_string());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 404);

        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("no_such_throttler"));

        let decoded: ErrorResponse = serde_json::from_str(&json).unwrap();
        let remote = decoded.into_error();
        assert_eq!(remote.code(), ErrorCode::NoSuchThrottler);
        assert!(remote.to_string().contains("uploads"));
    }

    #[test]
    fn test_code_display_matches_wire_name() {
        let codes = [
            ErrorCode::UnexpectedThrottlerMode,
            ErrorCode::NoSuchThrottler,
            ErrorCode::NoSuchService,
            ErrorCode::RequestQueueSizeLimitExceeded,
            ErrorCode::Validation,
            ErrorCode::Transport,
            ErrorCode::Discovery,
            ErrorCode::Config,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert_eq!(serde_json::to_string(&code).unwrap(), format!("\"{}\"", code));
        }
        assert_eq!(ErrorCode::RequestQueueSizeLimitExceeded.to_string(), "request_queue_size_limit_exceeded");
    }

    #[test]
    fn test_mode_mismatch_message() {
        let err = Error::unexpected_mode("heartbeat", ThrottlerMode::Precise);
        assert_eq!(err.to_string(), "Cannot handle heartbeat request in precise mode");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
