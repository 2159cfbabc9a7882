// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remora Server - hosts one resource instance inside a pod
//!
//! A resource type implements [`Resource`] and lists its business methods in
//! an explicit [`RouteTable`]. [`ResourceServer`] turns that table into an axum
//! router next to the fixed routes every instance serves.
//!
//! # Routes
//!
//! | Route | Lock checked | Description |
//! |-------|--------------|-------------|
//! | `GET\|POST /health` | no | `{"health": "ok"}` |
//! | `POST /info` | no | name, version, env-sha, uri |
//! | `POST /labels` | no | image labels of this type |
//! | `POST /schema` | no | JSON schema of the constructor parameters |
//! | `POST /lock`, `POST /unlock` | no | instance lock, see [`lock`] |
//! | `POST /save`, `POST /load` | yes | persist state to the artifact directory |
//! | `POST /diff`, `POST /merge` | - | not implemented (501) |
//! | `WS /logs` | no | recent and live log lines of this process |
//! | `POST /<method>` | yes | unary business method |
//! | `WS /<method>?data=<json>` | yes | streaming business method, one stream at a time |
//!
//! All routes except `health` and `info` require the `client-uuid` header.
//!
//! # Running
//!
//! A server binary is one line:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     remora_server::run::<MyResource>().await?;
//!     Ok(())
//! }
//! ```
//!
//! [`run`] restores the instance from a saved artifact, the mounted
//! `config.json`, `--params`, or defaults, in that order.

pub mod bootstrap;
pub mod demo;
pub mod error;
pub mod lock;
pub mod logs;
pub mod resource;
pub mod server;

pub use bootstrap::{Origin, ServerArgs, from_env, init_tracing, run};
pub use error::{ResourceError, Result};
pub use lock::{Lock, LockError, LockState};
pub use logs::LogBuffer;
pub use resource::{Resource, Route, RouteTable};
pub use server::{ResourceServer, ServerContext, artifact_path};
