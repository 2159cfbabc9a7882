// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finds an existing pod serving a desired image.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use remora_protocol::constants::{OWNER_ANNOTATION, URI_ANNOTATION};
use tracing::{debug, warn};

use crate::cluster::{Cluster, pod_is_terminal};
use crate::error::Result;

/// Looks up reusable pods by their `uri` annotation.
///
/// Ownership is advisory: a pod created by another caller is still returned,
/// with a warning. Nothing prevents two callers from picking the same pod.
#[derive(Clone)]
pub struct PodLocator {
    cluster: Arc<dyn Cluster>,
    owner: String,
}

impl PodLocator {
    /// Locator reporting mismatches against `owner`.
    pub fn new(cluster: Arc<dyn Cluster>, owner: impl Into<String>) -> Self {
        Self {
            cluster,
            owner: owner.into(),
        }
    }

    /// First pod in `namespace` whose `uri` annotation equals `desired_uri`.
    ///
    /// Pods without both `uri` and `owner` annotations were not created by
    /// the controller and are ignored, as are pods that are terminating or
    /// have terminated.
    pub async fn find_reusable(&self, namespace: &str, desired_uri: &str) -> Result<Option<Pod>> {
        let pods = self.cluster.list_pods(namespace).await?;
        debug!(namespace, candidates = pods.len(), "looking for reusable pod");

        for pod in pods {
            let Some(annotations) = pod.metadata.annotations.as_ref() else {
                continue;
            };
            let (Some(uri), Some(owner)) = (
                annotations.get(URI_ANNOTATION),
                annotations.get(OWNER_ANNOTATION),
            ) else {
                continue;
            };
            if uri != desired_uri {
                continue;
            }

            let name = pod.metadata.name.clone().unwrap_or_default();
            if pod.metadata.deletion_timestamp.is_some() || pod_is_terminal(&pod) {
                debug!(pod = %name, "skipping pod that is going away");
                continue;
            }
            if *owner != self.owner {
                warn!(
                    pod = %name,
                    owner = %owner,
                    caller = %self.owner,
                    "reusing pod owned by another client"
                );
            }
            return Ok(Some(pod));
        }
        Ok(None)
    }
}
