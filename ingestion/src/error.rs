use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Internal server error")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::Validation(msg),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            // Collection-consistency violations surface to the caller
            // before any work starts.
            AppError::Integrity(msg) => Self::Validation(msg),
            other => {
                tracing::error!(error = %other, "internal error");
                Self::Internal("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message.clone()),
            Self::Conflict(message) => (StatusCode::CONFLICT, message.clone()),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorBody {
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_violations_are_bad_requests() {
        let err = ApiError::from(AppError::Integrity("embedding model mismatch".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn auth_failures_are_unauthorized() {
        let err = ApiError::from(AppError::Auth("missing bearer token".into()));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
