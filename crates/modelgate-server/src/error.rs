//! HTTP error type for the modelgate server.
//!
//! Every failure a handler can produce maps into one closed taxonomy,
//! each code paired with an HTTP status. The response body is always the
//! uniform envelope `{"success": false, "error": <msg>, "code": <CODE>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use modelgate_core::{CryptoError, KeyError};
use modelgate_sidecar::SidecarError;
use modelgate_store::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// No/invalid session or API key.
    Unauthorized(String),
    /// CSRF failure or action not allowed.
    Forbidden(String),
    /// Unknown entity.
    NotFound(String),
    /// Malformed or semantically invalid input.
    Validation(String),
    /// Uniqueness or state conflict.
    Conflict(String),
    /// The user's `used_tokens` reached the quota.
    QuotaExceeded(String),
    /// Short-window rate ceiling hit.
    RateLimited(String),
    /// Sidecar or upstream failure.
    Provider(String),
    /// Anything else.
    Internal(String),
}

impl ApiError {
    /// Machine-readable code from the closed taxonomy.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::QuotaExceeded(_) | Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Conflict(msg)
            | Self::QuotaExceeded(msg)
            | Self::RateLimited(msg)
            | Self::Provider(msg)
            | Self::Internal(msg) => msg,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// The uniform JSON error envelope.
#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message(),
            code: self.code(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Self::Conflict(err.to_string()),
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::Corrupt { .. }
            | StoreError::Locked { .. }
            | StoreError::LockIo { .. }
            | StoreError::Migration(_)
            | StoreError::Database(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<SidecarError> for ApiError {
    fn from(err: SidecarError) -> Self {
        // Everything the sidecar layer reports — spawn failures, health
        // timeouts, unreadable credential rows — is a provider-side
        // condition from the caller's point of view.
        Self::Provider(err.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::MalformedKey => Self::Unauthorized("invalid API key".to_owned()),
            KeyError::Hash { .. } | KeyError::MalformedDigest { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}
