use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for limiter operations
pub type Result<T> = std::result::Result<T, LimiterError>;

/// Limiter error types
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("State for key {0} was modified concurrently")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LimiterError::UnknownPolicy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Validation(_) => StatusCode::BAD_REQUEST,
            LimiterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LimiterError::Conflict(_) => StatusCode::CONFLICT,
            LimiterError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for LimiterError {
    fn from(err: serde_json::Error) -> Self {
        LimiterError::Serialization(err.to_string())
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
