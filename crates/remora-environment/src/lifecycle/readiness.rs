// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-interval polling for pod readiness.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::{Cluster, pod_is_ready, pod_is_terminal, pod_phase};
use crate::error::Result;

/// Polls a pod until it reaches a state or the budget runs out.
///
/// A timeout resolves to `false`; the pod itself is left alone.
#[derive(Clone)]
pub struct ReadinessWaiter {
    cluster: Arc<dyn Cluster>,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    /// Waiter polling every `poll_interval`.
    pub fn new(cluster: Arc<dyn Cluster>, poll_interval: Duration) -> Self {
        Self {
            cluster,
            poll_interval,
        }
    }

    /// Wait until the pod is Running with the `Ready` condition.
    ///
    /// Returns `false` on timeout, when the pod disappears, or when it
    /// terminates.
    pub async fn wait_ready(&self, namespace: &str, name: &str, timeout: Duration) -> Result<bool> {
        self.wait_for(namespace, name, timeout, "ready", pod_is_ready)
            .await
    }

    /// Wait until the pod's containers have started (phase Running).
    pub async fn wait_running(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<bool> {
        self.wait_for(namespace, name, timeout, "running", |pod| {
            pod_phase(pod) == Some("Running")
        })
        .await
    }

    async fn wait_for(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        target: &'static str,
        reached: impl Fn(&Pod) -> bool,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(pod) = self.cluster.get_pod(namespace, name).await? else {
                debug!(pod = name, "pod disappeared while waiting");
                return Ok(false);
            };
            if reached(&pod) {
                debug!(pod = name, target, "pod reached state");
                return Ok(true);
            }
            if pod_is_terminal(&pod) {
                debug!(pod = name, phase = ?pod_phase(&pod), "pod terminated while waiting");
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            debug!(pod = name, target, phase = ?pod_phase(&pod), "waiting for pod");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
