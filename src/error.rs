use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::job::JobError;
use crate::materializer::MaterializeError;
use crate::outline_generator::OutlineError;
use crate::storage::StorageError;

/// Everything that can end a generation job. The display text is what lands
/// in the job's `error_message`.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("knowledge base analysis failed: {0}")]
    Analysis(#[source] StorageError),
    #[error(transparent)]
    Outline(#[from] OutlineError),
    #[error("outline persistence failed: {0}")]
    OutlinePersistence(#[source] StorageError),
    #[error("materialization failed: {0}")]
    Materialization(#[source] MaterializeError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0} seconds")]
    TimedOut(u64),
    #[error("generation task panicked: {0}")]
    Panicked(String),
}

impl From<MaterializeError> for GenerationError {
    fn from(e: MaterializeError) -> Self {
        match e {
            MaterializeError::Cancelled => GenerationError::Cancelled,
            other => GenerationError::Materialization(other),
        }
    }
}

/// HTTP error body: `{"error": {"code", "message"}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Logs the underlying error, like every other 500 path.
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        tracing::error!(error = %e, "internal error");
        ApiError::Internal(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::internal(e)
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", m),
        };
        let body = Json(json!({
            "error": { "code": code, "message": message }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_maps_through() {
        let e: GenerationError = MaterializeError::Cancelled.into();
        assert!(matches!(e, GenerationError::Cancelled));
        assert_eq!(e.to_string(), "cancelled");
    }

    #[test]
    fn invalid_request_is_a_400() {
        let api: ApiError =
            GenerationError::InvalidRequest("title must not be empty".into()).into();
        assert_eq!(api.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::NotFound("job".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
