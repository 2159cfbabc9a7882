// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON bodies exchanged with a resource server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Response wrapper for methods returning a non-mapping value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The method's return value.
    pub response: T,
}

impl<T> Envelope<T> {
    /// Wrap a value.
    pub fn new(response: T) -> Self {
        Self { response }
    }
}

/// Error body returned with any non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human readable message.
    pub error: String,
}

/// One message on a WebSocket stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    /// A yielded item.
    Item {
        /// The item value.
        response: Value,
    },
    /// Terminates the stream; the server closes the socket afterwards.
    End {
        /// Always `true`.
        end: bool,
    },
    /// The stream failed; no further items follow.
    Error {
        /// Failure message.
        error: String,
    },
}

impl StreamFrame {
    /// Frame carrying one item.
    pub fn item(response: Value) -> Self {
        StreamFrame::Item { response }
    }

    /// Terminal frame.
    pub fn end() -> Self {
        StreamFrame::End { end: true }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }
}

/// Body of `POST /lock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Key required to unlock and to call methods while locked.
    #[serde(default)]
    pub key: Option<String>,
    /// Seconds after which the lock expires.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Body of `POST /unlock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
    /// Key the lock was created with.
    #[serde(default)]
    pub key: Option<String>,
    /// Remove the lock regardless of key.
    #[serde(default)]
    pub force: bool,
}

/// Arguments of methods that take no parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoArgs {}

/// Body of `POST /info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Resource type name.
    pub name: String,
    /// Source fingerprint the process was built from.
    pub version: String,
    /// Dependency fingerprint.
    #[serde(rename = "env-sha")]
    pub env_sha: String,
    /// Image URI of the resource.
    pub uri: String,
}

/// Body of `GET|POST /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// `"ok"` when serving.
    pub health: String,
}

impl HealthStatus {
    /// Healthy status.
    pub fn ok() -> Self {
        Self {
            health: "ok".to_string(),
        }
    }
}
