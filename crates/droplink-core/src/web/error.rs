//! HTTP error handling for the web surface.
//!
//! This module provides conversion from core library errors to appropriate
//! HTTP responses with JSON error bodies. User-visible failure behavior is
//! always a status plus a short textual reason; nothing is silently
//! swallowed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// API error response body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// Error code (e.g. "E003" for rate limited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error message
    pub message: String,
    /// HTTP status for the response
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    /// Create a 400 bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: Some("E005".into()),
            message: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// Create a 403 error for an unconfirmed source.
    #[must_use]
    pub fn forbidden(source: &str) -> Self {
        Self {
            code: Some("E002".into()),
            message: format!("source '{source}' is not confirmed"),
            status: StatusCode::FORBIDDEN,
        }
    }

    /// Create a 429 error for a rate-limited source.
    #[must_use]
    pub fn rate_limited(source: &str) -> Self {
        Self {
            code: Some("E003".into()),
            message: format!("source '{source}' exceeded the request rate limit"),
            status: StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Create a 404 not found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// Create a 413 error for an oversized upload.
    #[must_use]
    pub fn payload_too_large(limit: u64) -> Self {
        Self {
            code: Some("E004".into()),
            message: format!("upload exceeds the {limit} byte cap"),
            status: StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Create an internal server error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        use crate::error::Error;

        let status = match &err {
            Error::NotConfirmed(_) => StatusCode::FORBIDDEN,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidMultipart(_) | Error::InvalidInput(_) | Error::TransferIncomplete { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::HashMismatch { .. }
            | Error::ChunkChecksumMismatch { .. }
            | Error::Encryption(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::UnknownTransfer(_) | Error::FileNotFound(_) | Error::UnknownStagedFile(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            code: err.code().map(String::from),
            message: err.to_string(),
            status,
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self {
            code: None,
            message: format!("I/O error: {err}"),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type for web handlers.
pub type ApiResult<T> = Result<T, ApiError>;
