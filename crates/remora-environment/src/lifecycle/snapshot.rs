// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshotting a running resource into a new image.
//!
//! The server container copies its saved state and its source tree into the
//! snapshot scratch volume, next to a generated `Containerfile.snapshot`
//! layered on the pod's image. An ephemeral builder container then builds and
//! pushes that context. The builder is polled until it terminates; there is no
//! way to cancel it.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ContainerState;
use remora_protocol::ResourceLabels;
use remora_protocol::constants::{ARTIFACT_DIR, REPO_ROOT, SERVER_CONTAINER};
use tracing::{debug, info};

use super::file_sync::tar_archive;
use crate::cluster::Cluster;
use crate::cluster::manifest::{SNAPSHOT_DIR, snapshot_container};
use crate::error::{Error, Result};
use crate::image::{ContainerFile, ImageIdentity, build_identity};

/// Name of the instruction file handed to the snapshot builder.
pub const SNAPSHOT_CONTAINERFILE: &str = "Containerfile.snapshot";

/// What to snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest<'a> {
    /// Namespace of the pod.
    pub namespace: &'a str,
    /// Pod name.
    pub pod: &'a str,
    /// Image the pod runs; the snapshot is layered on top of it.
    pub base_image: &'a str,
    /// Lowercase resource type name.
    pub short_name: &'a str,
    /// Source fingerprint of the running code.
    pub version: &'a str,
    /// Labels attached to the snapshot image.
    pub labels: &'a ResourceLabels,
}

/// Builds images from running pods with an ephemeral builder container.
#[derive(Clone)]
pub struct SnapshotStore {
    cluster: Arc<dyn Cluster>,
    image_repo: String,
    builder_image: String,
    poll_interval: Duration,
}

impl SnapshotStore {
    /// Store pushing to `image_repo` with the given builder image.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        image_repo: impl Into<String>,
        builder_image: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            image_repo: image_repo.into(),
            builder_image: builder_image.into(),
            poll_interval,
        }
    }

    /// `<repo>:<short name>-<version>-<epoch seconds>`.
    pub fn snapshot_identity(&self, short_name: &str, version: &str, epoch: i64) -> ImageIdentity {
        build_identity(&self.image_repo, &format!("{short_name}-{version}-{epoch}"))
    }

    /// Snapshot the pod's filesystem and return the pushed image.
    ///
    /// The caller persists the resource's state (`save`) before calling this.
    pub async fn snapshot(&self, request: SnapshotRequest<'_>) -> Result<ImageIdentity> {
        let epoch = chrono::Utc::now().timestamp();
        let identity = self.snapshot_identity(request.short_name, request.version, epoch);
        let destination = identity.reference();
        let SnapshotRequest { namespace, pod, .. } = request;

        self.cluster
            .exec(namespace, pod, SERVER_CONTAINER, stage_command())
            .await?;

        let containerfile = snapshot_containerfile(request.base_image).render();
        let archive = tar_archive([(SNAPSHOT_CONTAINERFILE, containerfile.as_bytes())])?;
        self.cluster
            .copy_archive(namespace, pod, SERVER_CONTAINER, SNAPSHOT_DIR, archive)
            .await?;

        let name = format!("snapshot-{epoch}");
        let container = snapshot_container(
            &name,
            &self.builder_image,
            &destination,
            SNAPSHOT_CONTAINERFILE,
            request.labels,
        );
        self.cluster
            .add_ephemeral_container(namespace, pod, &container)
            .await?;
        info!(pod, image = %destination, builder = %name, "snapshot started");

        self.wait_terminated(namespace, pod, &name).await?;
        info!(pod, image = %destination, "snapshot pushed");
        Ok(identity)
    }

    async fn wait_terminated(&self, namespace: &str, pod: &str, container: &str) -> Result<()> {
        loop {
            let state = self
                .cluster
                .get_pod(namespace, pod)
                .await?
                .ok_or_else(|| Error::Cluster(format!("pod {pod} disappeared during snapshot")))?
                .status
                .and_then(|s| s.ephemeral_container_statuses)
                .and_then(|statuses| statuses.into_iter().find(|s| s.name == container))
                .and_then(|s| s.state);

            match state {
                Some(ContainerState {
                    terminated: Some(terminated),
                    ..
                }) => {
                    if terminated.exit_code == 0 {
                        return Ok(());
                    }
                    return Err(Error::Snapshot {
                        reason: terminated.reason.unwrap_or_default(),
                        message: terminated.message.unwrap_or_default(),
                    });
                }
                Some(ContainerState {
                    waiting: Some(waiting),
                    ..
                }) => {
                    debug!(pod, container, reason = ?waiting.reason, "snapshot builder waiting");
                }
                Some(ContainerState {
                    running: Some(_), ..
                }) => {
                    debug!(pod, container, "snapshot builder running");
                }
                _ => debug!(pod, container, "snapshot builder not started"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Copies saved state and sources into the scratch volume; build output is skipped.
fn stage_command() -> Vec<String> {
    let script = format!(
        "rm -rf {dir}/artifacts {dir}/app && mkdir -p {dir}/artifacts {dir}/app \
         && cp -a {ARTIFACT_DIR}/. {dir}/artifacts/ \
         && tar -C {REPO_ROOT} --exclude=./target -cf - . | tar -C {dir}/app -xf -",
        dir = SNAPSHOT_DIR,
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

fn snapshot_containerfile(base_image: &str) -> ContainerFile {
    ContainerFile::from_image(base_image)
        .copy(["artifacts/"], format!("{ARTIFACT_DIR}/"))
        .copy(["app/"], format!("{REPO_ROOT}/"))
}
