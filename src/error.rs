use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LimiterError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store batch failed: {0}")]
    StoreBatchFailed(String),

    #[error("Stored value for '{key}' is not a valid {expected}")]
    SchemaMismatch { key: String, expected: &'static str },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, LimiterError>;

impl LimiterError {
    /// Transport-level failures, as opposed to the store rejecting a batch.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::StoreUnavailable(_) | LimiterError::StoreBatchFailed(_)
        )
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            LimiterError::StoreUnavailable(err.to_string())
        } else {
            LimiterError::StoreBatchFailed(err.to_string())
        }
    }
}

impl From<validator::ValidationErrors> for LimiterError {
    fn from(err: validator::ValidationErrors) -> Self {
        LimiterError::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_limiter_error(err: &LimiterError) -> Self {
        let message = err.to_string();
        match err {
            LimiterError::StoreUnavailable(_) | LimiterError::StoreBatchFailed(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            LimiterError::Validation(_) => Self::new("validation_error", &message, 422),
            LimiterError::SchemaMismatch { .. } => Self::new("internal_error", &message, 500),
            LimiterError::Configuration(_) => Self::new("configuration_error", &message, 500),
        }
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_limiter_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
