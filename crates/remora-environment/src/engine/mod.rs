// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine capability.
//!
//! The controller only needs four things from an engine: list local images,
//! build from a context and instruction file, push, and read image labels.

pub mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use docker::DockerCli;
pub use mock::MockEngine;

/// Builds, pushes and inspects images.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine type identifier (e.g., "docker", "mock")
    fn engine_type(&self) -> &'static str;

    /// References (`repository:tag`) of every locally cached image.
    async fn list_images(&self) -> Result<Vec<String>>;

    /// Build `image` from `context` using the instruction file `containerfile`.
    async fn build(
        &self,
        context: &Path,
        containerfile: &Path,
        image: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Push `image` to its registry.
    async fn push(&self, image: &str) -> Result<()>;

    /// Labels of `image`, pulling it first when it is not cached locally.
    ///
    /// Returns None when the image does not exist.
    async fn image_labels(&self, image: &str) -> Result<Option<BTreeMap<String, String>>>;
}
