//! Error Types for the PARLEY API
//!
//! `ApiError` is the single error type returned by route handlers. It
//! maps internal error kinds to HTTP status codes and serializes as
//! `{"detail": "..."}`. Internals never leak: database and crypto
//! failures are logged with their detail and surfaced generically.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_core::{ParleyError, RetrievalError, StoreError};
use serde::Serialize;
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error categories with fixed HTTP status mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Request lacks a caller identity.
    Unauthorized,
    /// Caller is authenticated but does not own the resource.
    Forbidden,
    /// Malformed input: bad session-id shape, missing fields, bad ranges.
    ValidationFailed,
    /// Entity does not exist (or is not visible to this caller).
    NotFound,
    /// Server-side configuration problem (undecryptable key, missing
    /// embedder).
    ConfigError,
    /// LLM / embedding / vector-store dependency failed.
    UpstreamError,
    /// Unexpected invariant violation.
    Internal,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ConfigError | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
        }
    }
}

// ============================================================================
// API ERROR
// ============================================================================

/// Structured error carried through handlers and rendered as
/// `{"detail": message}` with the code's status.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub detail: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl ApiError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, detail)
    }

    pub fn forbidden() -> Self {
        // Deliberately uniform: ownership failures must not reveal
        // whether the resource exists.
        Self::new(ErrorCode::Forbidden, "Access forbidden")
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, detail)
    }

    pub fn not_found(entity: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found", entity))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, detail)
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamError, detail)
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.detail)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "detail": self.detail }));
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, .. } => ApiError::not_found(entity),
            StoreError::PermissionDenied { .. } => ApiError::forbidden(),
            StoreError::InsertFailed { entity, reason } => {
                ApiError::validation(format!("cannot create {}: {}", entity, reason))
            }
            StoreError::UpdateFailed { entity, reason, .. } => {
                ApiError::validation(format!("cannot update {}: {}", entity, reason))
            }
            StoreError::Database { reason } => {
                tracing::error!(reason = %reason, "database error");
                ApiError::internal("Database operation failed")
            }
        }
    }
}

impl From<ParleyError> for ApiError {
    fn from(err: ParleyError) -> Self {
        match err {
            ParleyError::Store(e) => e.into(),
            ParleyError::Validation(e) => ApiError::validation(e.to_string()),
            ParleyError::Config(e) => {
                tracing::error!(error = %e, "configuration error");
                ApiError::new(ErrorCode::ConfigError, "Configuration error")
            }
            ParleyError::Llm(e) => ApiError::upstream(e.to_string()),
            ParleyError::Retrieval(e) => ApiError::upstream(e.to_string()),
            ParleyError::Cancelled => ApiError::internal("Operation cancelled"),
        }
    }
}

impl From<RetrievalError> for ApiError {
    fn from(err: RetrievalError) -> Self {
        ApiError::upstream(err.to_string())
    }
}

impl From<parley_core::ValidationError> for ApiError {
    fn from(err: parley_core::ValidationError) -> Self {
        ApiError::validation(err.to_string())
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::ValidationFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::ConfigError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::UpstreamError.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_store_error_mapping() {
        let err: ApiError = StoreError::NotFound {
            entity: "session",
            id: "sess_alice_0123abcd".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err: ApiError = StoreError::PermissionDenied {
            entity: "api_profile",
            id: "1".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[test]
    fn test_database_detail_not_leaked() {
        let err: ApiError = StoreError::Database {
            reason: "connection to 10.0.0.5 refused".to_string(),
        }
        .into();
        assert!(!err.detail.contains("10.0.0.5"));
    }

    #[test]
    fn test_forbidden_is_uniform() {
        assert_eq!(ApiError::forbidden(), ApiError::forbidden());
        assert!(!ApiError::forbidden().detail.contains("session"));
    }
}
