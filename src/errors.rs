use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Everything that can go wrong while staging, tracking or assembling chunks.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("upload `{upload_id}` was declared with {recorded} chunks, not {claimed}")]
    InconsistentTransfer {
        upload_id: String,
        recorded: u32,
        claimed: u32,
    },
    #[error("storage error: {0}")]
    Storage(#[from] io::Error),
    #[error("upload `{upload_id}` cannot be assembled: {reason}")]
    IncompleteTransfer { upload_id: String, reason: String },
    #[error("staging capacity exhausted: {requested} bytes requested, {available} available")]
    StorageExhausted { requested: u64, available: u64 },
    #[error("upload `{0}` is closed")]
    SessionClosed(String),
    #[error("upload `{0}` not found")]
    UnknownUpload(String),
    #[error("artifact registry error: {0}")]
    Registry(#[from] sqlx::Error),
}

impl UploadError {
    /// Whether the client may resend the same request later and expect success.
    ///
    /// A failed registry write leaves the session's staging in place, so the
    /// final chunk can be resent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::StorageExhausted { .. } | Self::Registry(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InconsistentTransfer { .. } => "inconsistent_transfer",
            Self::Storage(_) => "storage_error",
            Self::IncompleteTransfer { .. } => "incomplete_transfer",
            Self::StorageExhausted { .. } => "storage_exhausted",
            Self::SessionClosed(_) => "session_closed",
            Self::UnknownUpload(_) => "unknown_upload",
            Self::Registry(_) => "registry_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InconsistentTransfer { .. } => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::IncompleteTransfer { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::SessionClosed(_) => StatusCode::GONE,
            Self::UnknownUpload(_) => StatusCode::NOT_FOUND,
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// HTTP-facing error: a status plus a message the client can act on.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
    pub retryable: bool,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            kind: "error",
            retryable: false,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            kind: "validation_error",
            ..Self::new(StatusCode::BAD_REQUEST, msg)
        }
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
            "kind": self.kind,
            "retryable": self.retryable,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match &err {
            UploadError::Storage(_)
            | UploadError::Registry(_)
            | UploadError::IncompleteTransfer { .. } => {
                tracing::error!(error = %err, "upload request failed");
            }
            _ => tracing::debug!(error = %err, "upload request rejected"),
        }
        Self {
            status: err.status(),
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(UploadError::Storage(io::Error::other("disk")).is_retryable());
        assert!(
            UploadError::StorageExhausted {
                requested: 10,
                available: 0
            }
            .is_retryable()
        );
        assert!(UploadError::Registry(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!UploadError::SessionClosed("u1".into()).is_retryable());
        assert!(!UploadError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn upload_errors_map_to_http_statuses() {
        let cases = [
            (UploadError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                UploadError::InconsistentTransfer {
                    upload_id: "u".into(),
                    recorded: 3,
                    claimed: 4,
                },
                StatusCode::CONFLICT,
            ),
            (
                UploadError::Storage(io::Error::other("x")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                UploadError::StorageExhausted {
                    requested: 1,
                    available: 0,
                },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (UploadError::SessionClosed("u".into()), StatusCode::GONE),
            (UploadError::UnknownUpload("u".into()), StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            let kind = err.kind();
            let app: AppError = err.into();
            assert_eq!(app.status, status, "{kind}");
            assert_eq!(app.kind, kind);
        }
    }
}
