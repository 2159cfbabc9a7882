// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remora Environment - Remote Resource Lifecycle Controller
//!
//! This crate decides whether a resource needs a new image, whether a running
//! pod can be reused, how local source edits reach a running container, when a
//! pod is ready, and how a running instance is snapshotted into a new image.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        ResourceClient                                │
//! │          provision / from_uri / connect / store_cls / versions       │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────────────┐ │
//! │  │   Image    │ │    Pod     │ │    File    │ │     Readiness      │ │
//! │  │   Cache    │ │  Locator   │ │   Syncer   │ │      Waiter        │ │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ └─────────┬──────────┘ │
//! └────────┼──────────────┼──────────────┼──────────────────┼────────────┘
//!          │ build/push   │ list/create  │ exec tar         │ get pod
//!          ▼              ▼              ▼                  ▼
//!  ┌───────────────┐  ┌───────────────────────────────────────────────┐
//!  │ ContainerEngine│  │                   Cluster                     │
//!  │ (docker CLI)  │  │    (kube API, port-forward, ephemeral builder)│
//!  └───────────────┘  └───────────────────────────────────────────────┘
//!                                         │
//!                                         ▼
//!                         ┌──────────────────────────────┐
//!                         │ remora-server in a pod :8080 │◄── RemoteResource
//!                         └──────────────────────────────┘
//! ```
//!
//! # Sync Strategies
//!
//! | Strategy | Image tag keyed on | Source edits |
//! |----------|--------------------|--------------|
//! | `image` | full source fingerprint | rebuild and new pod |
//! | `container` (default) | dependency fingerprint | copied into the running pod, tracked by the `sync-sha` annotation |
//!
//! # Handle Operations
//!
//! | Operation | Transport | Notes |
//! |-----------|-----------|-------|
//! | `call`, `call_mapping` | `POST /<method>` | business methods |
//! | `stream` | `WS /<method>?data=` | items until the end frame |
//! | `info`, `health`, `labels`, `schema` | `POST`/`GET` | identity of the instance |
//! | `lock`, `unlock` | `POST` | the locking caller is the holder |
//! | `save`, `load` | `POST` | state inside the pod |
//! | `store` | save + ephemeral builder | returns a loadable image |
//! | `logs`, `pod_logs` | `WS /logs`, kube log | log lines |
//! | `delete` | kube | consumes the handle |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (and `.env`):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `REMORA_IMAGE_REPO` | Yes | - | Registry host and repository path |
//! | `REMORA_KUBE_NAMESPACE` | No | `remora` | Namespace of resource pods |
//! | `REMORA_REMOTE_SYNC_STRATEGY` | No | `container` | `image` or `container` |
//! | `REMORA_DOCKER_BIN` | No | `docker` | Container engine CLI |
//! | `REMORA_DOCKER_CONFIG` | No | `~/.docker/config.json` | Registry credentials |
//! | `REMORA_READY_TIMEOUT_SECS` | No | `300` | Readiness budget |
//! | `REMORA_POLL_INTERVAL_MS` | No | `1000` | Readiness poll interval |
//! | `REMORA_SNAPSHOT_POLL_INTERVAL_MS` | No | `1000` | Snapshot poll interval |
//! | `REMORA_SNAPSHOT_BUILDER_IMAGE` | No | kaniko executor | Snapshot builder |
//! | `REMORA_CLIENT_ID` | No | persisted UUID | Caller identity |
//!
//! # Modules
//!
//! - [`client`]: Provisioning orchestrator
//! - [`remote`]: Handle to a running resource
//! - [`lifecycle`]: Pod locator, file syncer, readiness waiter, snapshot store
//! - [`image`]: Image identity, build plans, build cache and registry tags
//! - [`cluster`]: Cluster capability (Kubernetes and mock)
//! - [`engine`]: Container engine capability (docker CLI and mock)
//! - [`scm`]: Source fingerprints and tracked files
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types

#![deny(missing_docs)]

/// Provisioning orchestrator.
pub mod client;

/// Stable caller identity.
pub mod client_id;

/// Cluster capability.
pub mod cluster;

/// Configuration loaded from environment variables.
pub mod config;

/// Container engine capability.
pub mod engine;

/// Error types for controller operations.
pub mod error;

/// Image identity, build plans and the image build cache.
pub mod image;

/// Building blocks of the provisioning state machine.
pub mod lifecycle;

/// Handle to a running resource.
pub mod remote;

/// Source control capability.
pub mod scm;

pub use client::{ProvisionRequest, ProvisionState, ResourceClient};
pub use cluster::{Cluster, KubeCluster, MockCluster};
pub use config::Config;
pub use engine::{ContainerEngine, DockerCli, MockEngine};
pub use error::{Error, Result};
pub use image::{ImageBuildCache, ImageIdentity};
pub use remote::RemoteResource;
pub use scm::{GitSource, SourceControl, StaticSource};
