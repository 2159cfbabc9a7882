// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster capability.
//!
//! Defines the abstract interface the controller uses to manage pods. The
//! production implementation is [`KubeCluster`]; [`MockCluster`] keeps pods in
//! memory and can host real resource servers for end-to-end tests.

pub mod k8s;
pub mod manifest;
pub mod mock;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, EphemeralContainer, Pod};
use tokio::task::JoinHandle;

use crate::error::Result;

pub use k8s::KubeCluster;
pub use mock::{MockArchive, MockCluster, PodBackend, PodOutcome, SnapshotOutcome};

/// Registry credentials and names of the per-namespace auth objects.
#[derive(Debug, Clone)]
pub struct AuthSpec {
    /// Service account resource pods run as.
    pub service_account: String,
    /// Secret of type `kubernetes.io/dockerconfigjson` holding registry credentials.
    pub docker_secret: String,
    /// Contents of the local docker `config.json`.
    pub docker_config: Vec<u8>,
}

impl AuthSpec {
    /// Default object names with the given credentials.
    pub fn new(docker_config: Vec<u8>) -> Self {
        Self {
            service_account: manifest::SERVICE_ACCOUNT.to_string(),
            docker_secret: manifest::DOCKER_SECRET.to_string(),
            docker_config,
        }
    }
}

/// A reachable address for a pod's server port.
///
/// Out of cluster this is a local port-forward; the forwarding task stops
/// when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct PodEndpoint {
    addr: SocketAddr,
    _forward: Option<Arc<ForwardTask>>,
}

#[derive(Debug)]
struct ForwardTask(JoinHandle<()>);

impl Drop for ForwardTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl PodEndpoint {
    /// Endpoint reached without forwarding (pod IP, or a test server).
    pub fn direct(addr: SocketAddr) -> Self {
        Self {
            addr,
            _forward: None,
        }
    }

    /// Endpoint served by a local forwarding task.
    pub fn forwarded(addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self {
            addr,
            _forward: Some(Arc::new(ForwardTask(task))),
        }
    }

    /// Socket address to connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Pod and ConfigMap management in one cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Cluster type identifier (e.g., "kube", "mock")
    fn cluster_type(&self) -> &'static str;

    /// Get or create the service account, registry secret and RBAC objects.
    async fn ensure_auth(&self, namespace: &str, auth: &AuthSpec) -> Result<()>;

    /// All pods in `namespace`.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// One pod, None if it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create a pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Delete a pod; deleting a missing pod succeeds.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge `annotations` into a pod's annotations.
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create a ConfigMap, replacing one with the same name.
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Delete a ConfigMap; deleting a missing one succeeds.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Add an ephemeral container to a running pod.
    async fn add_ephemeral_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &EphemeralContainer,
    ) -> Result<()>;

    /// Run `command` in a container and wait for it to succeed.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<()>;

    /// Extract a tar `archive` into `dest` inside a container.
    async fn copy_archive(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        dest: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Address of `port` on the pod, reachable from this process.
    async fn endpoint(&self, namespace: &str, pod: &str, port: u16) -> Result<PodEndpoint>;

    /// Follow a container's log.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

/// Phase reported in the pod status.
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Running with the `Ready` condition true.
pub fn pod_is_ready(pod: &Pod) -> bool {
    if pod_phase(pod) != Some("Running") {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Failed or Succeeded; the pod will never serve again.
pub fn pod_is_terminal(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Failed") | Some("Succeeded"))
}

/// Annotations of a pod, empty if none.
pub fn pod_annotations(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.annotations.clone().unwrap_or_default()
}
