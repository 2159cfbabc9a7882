// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Find-or-build over the local image cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use remora_protocol::{RemoteSyncStrategy, ResourceLabels, SourceStamp};
use tracing::{debug, info, warn};

use super::containerfile::ContainerFile;
use super::identity::{ImageIdentity, build_identity, compute_tag};
use crate::engine::ContainerEngine;
use crate::error::Result;

/// Inputs of one find-or-build.
#[derive(Debug, Clone, Copy)]
pub struct BuildSpec<'a> {
    /// Decides which fingerprint keys the tag.
    pub strategy: RemoteSyncStrategy,
    /// Source fingerprints.
    pub stamp: &'a SourceStamp,
    /// Prepended to the fingerprint in the tag.
    pub tag_prefix: Option<&'a str>,
    /// Build context directory; the instruction file is written here.
    pub context: &'a Path,
    /// Labels attached to the image.
    pub labels: &'a ResourceLabels,
    /// Install development dependencies.
    pub dev_dependencies: bool,
}

/// Content-addressed image cache in front of a [`ContainerEngine`].
///
/// The cache check and the build are not atomic: two callers racing on the
/// same tag may both build. Builds of the same tag are equivalent, so the
/// loser only wastes time.
#[derive(Clone)]
pub struct ImageBuildCache {
    engine: Arc<dyn ContainerEngine>,
    image_repo: String,
}

impl ImageBuildCache {
    /// Cache pushing to `image_repo` (registry host and repository path).
    pub fn new(engine: Arc<dyn ContainerEngine>, image_repo: impl Into<String>) -> Self {
        Self {
            engine,
            image_repo: image_repo.into(),
        }
    }

    /// Identity a spec resolves to, without touching the engine.
    pub fn identity(
        &self,
        strategy: RemoteSyncStrategy,
        stamp: &SourceStamp,
        tag_prefix: Option<&str>,
    ) -> ImageIdentity {
        build_identity(&self.image_repo, &compute_tag(strategy, stamp, tag_prefix))
    }

    /// Return the cached image for `spec`, or build and push it.
    ///
    /// `recipe` is only invoked on a miss and receives the strategy and the
    /// dev dependency flag.
    pub async fn find_or_build<F>(&self, spec: BuildSpec<'_>, recipe: F) -> Result<ImageIdentity>
    where
        F: FnOnce(RemoteSyncStrategy, bool) -> Result<ContainerFile>,
    {
        let identity = self.identity(spec.strategy, spec.stamp, spec.tag_prefix);
        let reference = identity.reference();

        let cached = self.engine.list_images().await?;
        if cached.iter().any(|image| *image == reference) {
            info!(image = %reference, "image cache hit");
            return Ok(identity);
        }

        info!(
            image = %reference,
            strategy = %spec.strategy,
            engine = self.engine.engine_type(),
            "image cache miss, building"
        );
        let containerfile = recipe(spec.strategy, spec.dev_dependencies)?;
        debug!(containerfile = %containerfile, "build plan");

        {
            let written = WrittenFile(containerfile.write_to(spec.context)?);
            self.engine
                .build(spec.context, &written.0, &reference, spec.labels.as_map())
                .await?;
        }

        self.engine.push(&reference).await?;
        info!(image = %reference, "image built and pushed");
        Ok(identity)
    }
}

/// Removes the instruction file however the build ends.
struct WrittenFile(PathBuf);

impl Drop for WrittenFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %e, "failed to remove build file");
        }
    }
}
