// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for remora-server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use remora_protocol::ErrorBody;
use thiserror::Error;

use crate::lock::LockError;

/// Errors raised while serving a resource.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// Request body or query could not be decoded into the method's arguments.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request lacks the `client-uuid` header.
    #[error("'client-uuid' must be present in headers")]
    MissingClientId,

    /// Lock operation or lock check failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Another client is already consuming a stream from this instance.
    #[error("Stream already in progress for this instance")]
    StreamBusy,

    /// No method with this name is registered.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Declared but not implemented.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// No saved state exists.
    #[error("No saved state at {0}")]
    NoArtifact(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The resource method itself failed.
    #[error("{0}")]
    Method(String),
}

impl ResourceError {
    /// HTTP status the error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            ResourceError::BadRequest(_) | ResourceError::MissingClientId => {
                StatusCode::BAD_REQUEST
            }
            ResourceError::Lock(LockError::Conflict) | ResourceError::StreamBusy => {
                StatusCode::CONFLICT
            }
            ResourceError::Lock(LockError::Forbidden) => StatusCode::FORBIDDEN,
            ResourceError::Lock(LockError::Locked) => StatusCode::LOCKED,
            ResourceError::UnknownMethod(_) | ResourceError::NoArtifact(_) => {
                StatusCode::NOT_FOUND
            }
            ResourceError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convenience constructor for method failures.
    pub fn method(msg: impl Into<String>) -> Self {
        ResourceError::Method(msg.into())
    }
}

impl IntoResponse for ResourceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Result type using [`ResourceError`].
pub type Result<T> = std::result::Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ResourceError::from(LockError::Conflict).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ResourceError::from(LockError::Forbidden).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ResourceError::from(LockError::Locked).status(),
            StatusCode::LOCKED
        );
        assert_eq!(ResourceError::StreamBusy.status(), StatusCode::CONFLICT);
        assert_eq!(
            ResourceError::MissingClientId.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ResourceError::NotImplemented("diff").status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ResourceError::method("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
