use crate::services::{metadata_store::MetadataError, storage::StorageError};
use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Rejections produced by the upload state machine.
///
/// Validation variants are raised before anything is mutated. Only
/// `StorageUnavailable` is transient; everything else is final for the
/// request as sent.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{id}` is at offset {actual}, request was sent for offset {expected}")]
    OffsetMismatch {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("upload would exceed its limit of {limit} bytes")]
    LengthExceeded { limit: u64 },
    #[error("invalid upload length: {0}")]
    InvalidLength(String),
    #[error("upload `{0}` already has a declared length")]
    AlreadySet(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid concatenation: {0}")]
    InvalidConcat(String),
    #[error("upload `{0}` was terminated while the request was in flight")]
    Terminated(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Whether the same request may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::StorageUnavailable(_))
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => UploadError::NotFound(id),
            StorageError::OffsetMismatch {
                id,
                expected,
                actual,
            } => UploadError::OffsetMismatch {
                id,
                expected,
                actual,
            },
            other => UploadError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<MetadataError> for UploadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(id) => UploadError::NotFound(id),
            MetadataError::InvalidOffset {
                id,
                current,
                requested,
            } => UploadError::OffsetMismatch {
                id,
                expected: requested,
                actual: current,
            },
            MetadataError::AlreadySet(id) => UploadError::AlreadySet(id),
            other => UploadError::StorageUnavailable(other.to_string()),
        }
    }
}

/// A lightweight wrapper for errors that reach the HTTP layer.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra response headers, e.g. `Tus-Version` on version mismatch.
    pub headers: Vec<(&'static str, HeaderValue)>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            UploadError::LengthExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::InvalidLength(_)
            | UploadError::AlreadySet(_)
            | UploadError::InvalidConcat(_) => StatusCode::BAD_REQUEST,
            UploadError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            UploadError::Forbidden(_) => StatusCode::FORBIDDEN,
            UploadError::Terminated(_) => StatusCode::GONE,
            UploadError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        } else {
            tracing::debug!("request rejected: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
