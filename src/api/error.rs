//! API error types with structured JSON responses.
//!
//! Every user-visible error carries a stable code and, for state
//! errors, the booking's current state so clients can reconcile.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::blobstore::BlobError;
use crate::db::DatabaseError;
use crate::export::ExportError;
use crate::inference::InferenceError;
use crate::models::BookingStatus;
use crate::pipeline::booking::PipelineError;
use crate::pipeline::rag::RagError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Account locked until {0}")]
    Locked(String),
    #[error("Operation not permitted")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("State conflict")]
    StateConflict { current: BookingStatus },
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unsupported media type: {0}")]
    Unsupported(String),
    #[error("Rate limit exceeded")]
    QuotaExceeded { retry_after: u64 },
    #[error("Service overloaded")]
    Overloaded { retry_after: u64 },
    #[error("Export failed: {0}")]
    ExportFailed(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, current_state, retry_after) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "Authentication required".to_string(),
                None,
                None,
            ),
            ApiError::Locked(until) => (
                StatusCode::UNAUTHORIZED,
                "ACCOUNT_LOCKED",
                format!("Account locked until {until}"),
                None,
                None,
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Operation not permitted for this role".to_string(),
                None,
                None,
            ),
            ApiError::NotFound(detail) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone(), None, None)
            }
            ApiError::StateConflict { current } => (
                StatusCode::CONFLICT,
                "STATE_CONFLICT",
                format!("Booking is {}", current.as_str()),
                Some(current.as_str()),
                None,
            ),
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                detail.clone(),
                None,
                None,
            ),
            ApiError::Unsupported(media) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED",
                format!("Unsupported media type: {media}"),
                None,
                None,
            ),
            ApiError::QuotaExceeded { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "QUOTA_EXCEEDED",
                format!("Rate limit exceeded, retry after {retry_after}s"),
                None,
                Some(*retry_after),
            ),
            ApiError::Overloaded { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "OVERLOADED",
                format!("Inference queue full, retry after {retry_after}s"),
                None,
                Some(*retry_after),
            ),
            ApiError::ExportFailed(detail) => (
                StatusCode::BAD_GATEWAY,
                "EXPORT_FAILED",
                detail.clone(),
                None,
                None,
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                    None,
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message,
                current_state,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::Unauthorized,
            AuthError::SessionExpired => ApiError::Unauthorized,
            AuthError::Locked(until) => ApiError::Locked(until),
            AuthError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(id) => ApiError::NotFound(format!("booking {id}")),
            PipelineError::StateConflict { current } => ApiError::StateConflict { current },
            PipelineError::Forbidden => ApiError::Forbidden,
            PipelineError::Validation(detail) => ApiError::BadRequest(detail),
            PipelineError::Unextractable(detail) => ApiError::BadRequest(format!(
                "document could not be extracted: {detail}"
            )),
            PipelineError::Overloaded => ApiError::Overloaded { retry_after: 30 },
            PipelineError::Blob(BlobError::UnsupportedMedia(media)) => ApiError::Unsupported(media),
            PipelineError::Blob(BlobError::NotFound(id)) => ApiError::NotFound(format!("blob {id}")),
            PipelineError::Inference(InferenceError::Overloaded { retry_after_secs }) => {
                ApiError::Overloaded {
                    retry_after: retry_after_secs,
                }
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::NotFound(id) => ApiError::NotFound(format!("booking {id}")),
            ExportError::NotExportable { current } => ApiError::StateConflict { current },
            ExportError::UnknownTarget(name) => ApiError::BadRequest(format!("unknown target {name}")),
            ExportError::Pending { .. } | ExportError::Permanent(_) => {
                ApiError::ExportFailed(err.to_string())
            }
            ExportError::Database(e) => ApiError::Internal(e.to_string()),
            ExportError::Pipeline(e) => e.into(),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::NotFound(id) => ApiError::NotFound(format!("law chunk {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
