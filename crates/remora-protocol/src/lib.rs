// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remora Protocol - HTTP/WebSocket contract between callers and resource pods
//!
//! This crate holds everything both sides of a remote resource must agree on:
//! - The JSON envelopes used by `POST /<method>` and the frames used by
//!   WebSocket streams
//! - Lock and unlock request bodies
//! - Pod label and annotation keys, the server port and fixed mount paths
//! - The [`RemoteSyncStrategy`] and the [`ResourceDescriptor`] that describes a
//!   resource type to the controller
//! - `k8s://<namespace>/<pod>` process URIs
//!
//! # Wire Format
//!
//! ```text
//! POST /<method>      {param: value, ...}         -> {"response": <value>}
//! POST /info|labels   {}                          -> {<mapping>}
//! GET|POST /health                                -> {"health": "ok"}
//! WS   /<stream>?data=<json args>                 -> {"response": item}* {"end": true}
//! errors                                          -> {"error": "<message>"}
//! ```
//!
//! Every request except `health` and `info` carries a `client-uuid` header.

pub mod constants;
pub mod descriptor;
pub mod strategy;
pub mod uri;
pub mod wire;

pub use descriptor::{ResourceDescriptor, ResourceLabels, SourceStamp};
pub use strategy::RemoteSyncStrategy;
pub use uri::K8sUri;
pub use wire::{
    Envelope, ErrorBody, HealthStatus, InfoResponse, LockRequest, NoArgs, StreamFrame,
    UnlockRequest,
};

/// Errors raised while parsing protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Sync strategy string is not one of the known strategies.
    #[error("unknown sync strategy: {0}")]
    UnknownStrategy(String),

    /// Process URI is malformed.
    #[error("invalid process uri: {0}")]
    InvalidUri(String),

    /// A stream frame could not be decoded.
    #[error("invalid stream frame: {0}")]
    InvalidFrame(String),
}
