use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GovernanceError>;

impl GovernanceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GovernanceError::NotFound(_) => StatusCode::NOT_FOUND,
            GovernanceError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GovernanceError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            GovernanceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GovernanceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GovernanceError::Configuration(_) | GovernanceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<sqlx::Error> for GovernanceError {
    fn from(err: sqlx::Error) -> Self {
        GovernanceError::StorageUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for GovernanceError {
    fn from(err: redis::RedisError) -> Self {
        GovernanceError::StorageUnavailable(err.to_string())
    }
}

impl From<validator::ValidationErrors> for GovernanceError {
    fn from(err: validator::ValidationErrors) -> Self {
        GovernanceError::Validation(err.to_string())
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

    pub fn from_error(err: &GovernanceError) -> Self {
        let code = err.status_code().as_u16();
        match err {
            GovernanceError::NotFound(msg) => Self::new("not_found", msg, code),
            GovernanceError::StorageUnavailable(msg) => Self::new("service_unavailable", msg, code),
            GovernanceError::InvalidIdentity(msg) => Self::new("invalid_identity", msg, code),
            GovernanceError::Unauthorized(msg) => Self::new("unauthorized", msg, code),
            GovernanceError::Validation(msg) => Self::new("validation_error", msg, code),
            GovernanceError::Configuration(msg) => Self::new("configuration_error", msg, code),
            GovernanceError::Internal(msg) => Self::new("internal_error", msg, code),
        }
    }
}

impl IntoResponse for GovernanceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GovernanceError::NotFound("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GovernanceError::StorageUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GovernanceError::InvalidIdentity("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GovernanceError::Unauthorized("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_error_response_body() {
        let body = ErrorResponse::from_error(&GovernanceError::Validation("limit too large".into()));
        assert_eq!(body.error, "validation_error");
        assert_eq!(body.message, "limit too large");
        assert_eq!(body.code, 422);
    }
}
