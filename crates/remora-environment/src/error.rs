// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for remora-environment.

use std::path::PathBuf;

use thiserror::Error;

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No dependency manifest marks the repository as a known project kind.
    #[error("Unknown project kind at {}: expected Cargo.lock, requirements.txt or environment.yml", .0.display())]
    UnknownProjectKind(PathBuf),

    /// The container engine failed to build an image.
    #[error("Image build failed: {0}")]
    Build(String),

    /// The container engine failed to push an image.
    #[error("Image push failed: {0}")]
    Push(String),

    /// An image carries none of the labels written at build time.
    #[error("Image {0} has no resource labels, was it built by remora?")]
    MissingLabels(String),

    /// The pod did not become ready within the readiness budget.
    #[error("Pod {pod} never became ready")]
    PodNeverReady {
        /// Pod name.
        pod: String,
    },

    /// An unexpired lock is already held.
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// The lock is held under another key and `force` was not set.
    #[error("Unlock forbidden: {0}")]
    LockForbidden(String),

    /// The instance is locked by another caller.
    #[error("Resource locked: {0}")]
    Locked(String),

    /// The ephemeral snapshot builder terminated unsuccessfully.
    #[error("Snapshot failed: {reason}: {message}")]
    Snapshot {
        /// Termination reason reported by the kubelet.
        reason: String,
        /// Termination message reported by the kubelet.
        message: String,
    },

    /// Copying files into a running container failed.
    #[error("File sync failed: {0}")]
    Sync(String),

    /// Kubernetes API call failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Cluster operation failed outside the API client.
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket stream failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol value could not be parsed.
    #[error(transparent)]
    Protocol(#[from] remora_protocol::ProtocolError),

    /// The resource server answered with an error status.
    #[error("Remote error ({status}): {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The resource server does not implement the operation.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The operation is not supported by this controller.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A URI could not be interpreted.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// The source tree could not be read from version control.
    #[error("Source control error: {0}")]
    SourceControl(String),
}

impl Error {
    /// Whether the caller can recover by retrying with the right key or after expiry.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Error::LockConflict(_) | Error::LockForbidden(_) | Error::Locked(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}

/// Result type using the controller Error.
pub type Result<T> = std::result::Result<T, Error>;
