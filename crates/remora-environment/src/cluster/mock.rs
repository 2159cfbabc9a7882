// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster for testing.
//!
//! Pods live in memory. With a [`PodBackend`] every created pod is backed by
//! a real server (typically a `remora_server::ResourceServer` on an ephemeral
//! port), so the controller can be exercised end to end without Kubernetes.
//!
//! Pods labelled with the container sync strategy behave like their
//! supervising entrypoint: the server starts on the first synced tree and
//! restarts, on the same port, whenever a sync marker with a new revision is
//! copied into the repository root.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStatus, EnvVar, EphemeralContainer, Pod, PodCondition, PodStatus,
};
use remora_protocol::RemoteSyncStrategy;
use remora_protocol::constants::{
    REPO_ROOT, REPO_SHA_ENV, SERVER_CONTAINER, SYNC_MARKER, SYNC_STRATEGY_LABEL,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::{AuthSpec, Cluster, PodEndpoint};
use crate::error::{Error, Result};

/// Starts a server for a pod.
///
/// Receives the pod, its params ConfigMap, the listener of the pod's port and
/// a signal to shut down gracefully on. The returned task ends once the
/// server stopped.
pub type PodBackend = Arc<
    dyn Fn(
            Pod,
            Option<ConfigMap>,
            TcpListener,
            oneshot::Receiver<()>,
        ) -> BoxFuture<'static, Result<JoinHandle<()>>>
        + Send
        + Sync,
>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Status created pods settle in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodOutcome {
    /// Running and Ready.
    #[default]
    Ready,
    /// Stuck in Pending.
    NeverReady,
    /// Phase Failed.
    Failed,
}

/// How the snapshot builder ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Exit code of the builder.
    pub exit_code: i32,
    /// Termination reason.
    pub reason: String,
    /// Termination message.
    pub message: String,
    /// Number of status reads reporting `running` before termination.
    pub running_polls: usize,
}

impl Default for SnapshotOutcome {
    fn default() -> Self {
        Self {
            exit_code: 0,
            reason: "Completed".to_string(),
            message: String::new(),
            running_polls: 1,
        }
    }
}

/// An archive extracted into a container.
#[derive(Debug, Clone)]
pub struct MockArchive {
    /// Pod name.
    pub pod: String,
    /// Destination directory.
    pub dest: String,
    /// Tar bytes.
    pub archive: Vec<u8>,
}

struct MockServer {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Shut down gracefully, closing idle connections. Aborts after the grace period.
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MockPod {
    pod: Pod,
    /// Port of the pod; outlives server restarts.
    listener: Option<StdTcpListener>,
    server: Option<MockServer>,
    starts: usize,
    ephemeral: Vec<(EphemeralContainer, usize)>,
}

impl MockPod {
    fn new(pod: Pod) -> Self {
        Self {
            pod,
            listener: None,
            server: None,
            starts: 0,
            ephemeral: Vec::new(),
        }
    }

    fn addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    fn synced_by_container(&self) -> bool {
        self.pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SYNC_STRATEGY_LABEL))
            .is_some_and(|s| s == RemoteSyncStrategy::Container.as_str())
    }
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Mock cluster for testing.
pub struct MockCluster {
    pods: Mutex<BTreeMap<Key, MockPod>>,
    config_maps: Mutex<BTreeMap<Key, ConfigMap>>,
    archives: Mutex<Vec<MockArchive>>,
    execs: Mutex<Vec<Vec<String>>>,
    auth_count: AtomicUsize,
    create_count: AtomicUsize,
    backend: Option<PodBackend>,
    /// Status created pods settle in
    pub outcome: PodOutcome,
    /// How snapshot builders end
    pub snapshot: SnapshotOutcome,
    /// If true, archive copies fail
    pub fail_copy: bool,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create a mock cluster whose pods become ready but serve nothing.
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(BTreeMap::new()),
            config_maps: Mutex::new(BTreeMap::new()),
            archives: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            auth_count: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
            backend: None,
            outcome: PodOutcome::Ready,
            snapshot: SnapshotOutcome::default(),
            fail_copy: false,
        }
    }

    /// Create a mock cluster starting `backend` for every created pod.
    pub fn with_backend(backend: PodBackend) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    /// Create a mock cluster whose pods stay Pending.
    pub fn never_ready() -> Self {
        Self {
            outcome: PodOutcome::NeverReady,
            ..Self::new()
        }
    }

    /// Seed a pod as if someone else had created it.
    pub async fn insert_pod(&self, namespace: &str, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let pod = with_status(pod, PodOutcome::Ready);
        self.pods
            .lock()
            .await
            .insert(key(namespace, &name), MockPod::new(pod));
    }

    /// Names of the pods in `namespace`.
    pub async fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.pods
            .lock()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names of the ConfigMaps in `namespace`.
    pub async fn config_map_names(&self, namespace: &str) -> Vec<String> {
        self.config_maps
            .lock()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Archives extracted so far.
    pub async fn archives(&self) -> Vec<MockArchive> {
        self.archives.lock().await.clone()
    }

    /// Commands executed so far.
    pub async fn execs(&self) -> Vec<Vec<String>> {
        self.execs.lock().await.clone()
    }

    /// Ephemeral containers added to a pod.
    pub async fn ephemeral_containers(&self, namespace: &str, pod: &str) -> Vec<EphemeralContainer> {
        self.pods
            .lock()
            .await
            .get(&key(namespace, pod))
            .map(|p| p.ephemeral.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of `ensure_auth` calls.
    pub fn auth_count(&self) -> usize {
        self.auth_count.load(Ordering::SeqCst)
    }

    /// Number of pods created through the trait.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Number of times the server of a pod was started.
    pub async fn server_starts(&self, namespace: &str, pod: &str) -> usize {
        self.pods
            .lock()
            .await
            .get(&key(namespace, pod))
            .map_or(0, |p| p.starts)
    }

    /// Start the backend on the pod's port.
    async fn start_server(&self, namespace: &str, entry: &mut MockPod, pod: Pod) -> Result<()> {
        let (Some(backend), Some(listener)) = (&self.backend, &entry.listener) else {
            return Ok(());
        };
        let listener = TcpListener::from_std(listener.try_clone()?)?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        let config_map = self
            .config_maps
            .lock()
            .await
            .get(&key(namespace, &name))
            .cloned();

        let (shutdown, signal) = oneshot::channel();
        let task = backend(pod, config_map, listener, signal).await?;
        entry.server = Some(MockServer {
            shutdown: Some(shutdown),
            task,
        });
        entry.starts += 1;
        Ok(())
    }

    fn ephemeral_status(&self, container: &EphemeralContainer, polls: usize) -> ContainerStatus {
        let state = if polls < self.snapshot.running_polls {
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }
        } else {
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: self.snapshot.exit_code,
                    reason: Some(self.snapshot.reason.clone()),
                    message: Some(self.snapshot.message.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }
        };
        ContainerStatus {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
            state: Some(state),
            ..Default::default()
        }
    }
}

fn with_status(mut pod: Pod, outcome: PodOutcome) -> Pod {
    let (phase, ready) = match outcome {
        PodOutcome::Ready => ("Running", "True"),
        PodOutcome::NeverReady => ("Pending", "False"),
        PodOutcome::Failed => ("Failed", "False"),
    };
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        pod_ip: Some("127.0.0.1".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: ready.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

/// Revision recorded by the sync marker of a tree, if the archive carries one.
fn synced_revision(archive: &[u8]) -> Option<String> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.path().ok()?.as_ref() == Path::new(SYNC_MARKER) {
            let mut revision = String::new();
            entry.read_to_string(&mut revision).ok()?;
            return Some(revision.trim().to_string());
        }
    }
    None
}

/// The pod as its entrypoint runs the server: `REPO_SHA` is the synced revision.
fn with_revision(mut pod: Pod, revision: &str) -> Pod {
    let servers = pod
        .spec
        .iter_mut()
        .flat_map(|spec| spec.containers.iter_mut())
        .filter(|c| c.name == SERVER_CONTAINER);
    for container in servers {
        let env = container.env.get_or_insert_with(Vec::new);
        env.retain(|var| var.name != REPO_SHA_ENV);
        env.push(EnvVar {
            name: REPO_SHA_ENV.to_string(),
            value: Some(revision.to_string()),
            ..Default::default()
        });
    }
    pod
}

#[async_trait]
impl Cluster for MockCluster {
    fn cluster_type(&self) -> &'static str {
        "mock"
    }

    async fn ensure_auth(&self, _namespace: &str, _auth: &AuthSpec) -> Result<()> {
        self.auth_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.pod.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let mut pods = self.pods.lock().await;
        let Some(entry) = pods.get_mut(&key(namespace, name)) else {
            return Ok(None);
        };

        let mut pod = entry.pod.clone();
        if !entry.ephemeral.is_empty() {
            let statuses = entry
                .ephemeral
                .iter_mut()
                .map(|(container, polls)| {
                    let status = self.ephemeral_status(container, *polls);
                    *polls += 1;
                    status
                })
                .collect();
            if let Some(status) = pod.status.as_mut() {
                status.ephemeral_container_statuses = Some(statuses);
            }
        }
        Ok(Some(pod))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Cluster("pod has no name".to_string()))?;
        if self.pods.lock().await.contains_key(&key(namespace, &name)) {
            return Err(Error::Cluster(format!("pod {name} already exists")));
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);

        let created = with_status(pod.clone(), self.outcome);
        let mut entry = MockPod::new(created.clone());
        if self.backend.is_some() && self.outcome == PodOutcome::Ready {
            let listener = StdTcpListener::bind("127.0.0.1:0")?;
            listener.set_nonblocking(true)?;
            entry.listener = Some(listener);
            // Container-synced pods wait for their first tree
            if !entry.synced_by_container() {
                self.start_server(namespace, &mut entry, pod.clone()).await?;
            }
        }

        self.pods.lock().await.insert(key(namespace, &name), entry);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self.pods.lock().await.remove(&key(namespace, name));
        if let Some(server) = removed.and_then(|mut entry| entry.server.take()) {
            server.stop().await;
        }
        Ok(())
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut pods = self.pods.lock().await;
        let entry = pods
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::Cluster(format!("pod {name} not found")))?;
        entry
            .pod
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.config_maps
            .lock()
            .await
            .insert(key(namespace, &name), config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.config_maps.lock().await.remove(&key(namespace, name));
        Ok(())
    }

    async fn add_ephemeral_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &EphemeralContainer,
    ) -> Result<()> {
        let mut pods = self.pods.lock().await;
        let entry = pods
            .get_mut(&key(namespace, pod))
            .ok_or_else(|| Error::Cluster(format!("pod {pod} not found")))?;
        entry.ephemeral.push((container.clone(), 0));
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
    ) -> Result<()> {
        if !self.pods.lock().await.contains_key(&key(namespace, pod)) {
            return Err(Error::Cluster(format!("pod {pod} not found")));
        }
        self.execs.lock().await.push(command);
        Ok(())
    }

    async fn copy_archive(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        dest: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        if self.fail_copy {
            return Err(Error::Sync(format!("mock copy into {pod} failed")));
        }
        let revision = if dest == REPO_ROOT {
            synced_revision(&archive)
        } else {
            None
        };

        let mut pods = self.pods.lock().await;
        let entry = pods
            .get_mut(&key(namespace, pod))
            .ok_or_else(|| Error::Sync(format!("pod {pod} not found")))?;
        self.archives.lock().await.push(MockArchive {
            pod: pod.to_string(),
            dest: dest.to_string(),
            archive,
        });

        if let Some(revision) = revision
            && entry.synced_by_container()
        {
            if let Some(server) = entry.server.take() {
                server.stop().await;
            }
            let serving = with_revision(entry.pod.clone(), &revision);
            self.start_server(namespace, entry, serving).await?;
        }
        Ok(())
    }

    async fn endpoint(&self, namespace: &str, pod: &str, _port: u16) -> Result<PodEndpoint> {
        let pods = self.pods.lock().await;
        let entry = pods
            .get(&key(namespace, pod))
            .ok_or_else(|| Error::Cluster(format!("pod {pod} not found")))?;
        entry
            .server
            .as_ref()
            .and(entry.addr())
            .map(PodEndpoint::direct)
            .ok_or_else(|| Error::Cluster(format!("pod {pod} has no server")))
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        if !self.pods.lock().await.contains_key(&key(namespace, pod)) {
            return Err(Error::Cluster(format!("pod {pod} not found")));
        }
        let lines = vec![Ok(format!("pod {pod} started"))];
        Ok(stream::iter(lines).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn named(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_created_pods_are_ready_and_deletable() {
        let cluster = MockCluster::new();
        let created = cluster.create_pod("ns", &named("p")).await.unwrap();
        assert!(super::super::pod_is_ready(&created));
        assert_eq!(cluster.pod_names("ns").await, vec!["p"]);

        cluster.delete_pod("ns", "p").await.unwrap();
        assert!(cluster.get_pod("ns", "p").await.unwrap().is_none());
        // Idempotent
        cluster.delete_pod("ns", "p").await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_container_terminates_after_polls() {
        let cluster = MockCluster::new();
        cluster.create_pod("ns", &named("p")).await.unwrap();
        let container = EphemeralContainer {
            name: "snapshot-1".to_string(),
            ..Default::default()
        };
        cluster
            .add_ephemeral_container("ns", "p", &container)
            .await
            .unwrap();

        let state = |pod: Pod| {
            pod.status.unwrap().ephemeral_container_statuses.unwrap()[0]
                .state
                .clone()
                .unwrap()
        };
        let first = state(cluster.get_pod("ns", "p").await.unwrap().unwrap());
        assert!(first.running.is_some());
        let second = state(cluster.get_pod("ns", "p").await.unwrap().unwrap());
        assert_eq!(second.terminated.unwrap().exit_code, 0);
    }

    fn tree(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Backend recording the `REPO_SHA` each start sees.
    fn recording_backend(revisions: Arc<std::sync::Mutex<Vec<String>>>) -> PodBackend {
        Arc::new(
            move |pod: Pod,
                  _config_map: Option<ConfigMap>,
                  listener: TcpListener,
                  signal: oneshot::Receiver<()>| {
                let revisions = revisions.clone();
                async move {
                    let revision = pod
                        .spec
                        .iter()
                        .flat_map(|spec| spec.containers.iter())
                        .flat_map(|c| c.env.iter().flatten())
                        .find(|var| var.name == REPO_SHA_ENV)
                        .and_then(|var| var.value.clone())
                        .unwrap_or_default();
                    revisions.lock().unwrap().push(revision);
                    let task = tokio::spawn(async move {
                        let _ = signal.await;
                        drop(listener);
                    });
                    Ok::<_, Error>(task)
                }
                .boxed()
            },
        )
    }

    fn container_synced(name: &str) -> Pod {
        let mut pod = named(name);
        pod.metadata.labels = Some(BTreeMap::from([(
            SYNC_STRATEGY_LABEL.to_string(),
            RemoteSyncStrategy::Container.as_str().to_string(),
        )]));
        pod
    }

    #[tokio::test]
    async fn test_synced_marker_restarts_container_server() {
        let revisions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cluster = MockCluster::with_backend(recording_backend(revisions.clone()));
        cluster.create_pod("ns", &container_synced("p")).await.unwrap();

        // Nothing serves before the first tree arrives
        assert_eq!(cluster.server_starts("ns", "p").await, 0);
        assert!(cluster.endpoint("ns", "p", 8080).await.is_err());

        cluster
            .copy_archive("ns", "p", "server", REPO_ROOT, tree(&[(SYNC_MARKER, "r1\n")]))
            .await
            .unwrap();
        let first = cluster.endpoint("ns", "p", 8080).await.unwrap().addr();

        cluster
            .copy_archive(
                "ns",
                "p",
                "server",
                REPO_ROOT,
                tree(&[("src/main.rs", ""), (SYNC_MARKER, "r2\n")]),
            )
            .await
            .unwrap();
        // Archives without a marker, or outside the repository, leave it running
        cluster
            .copy_archive("ns", "p", "server", REPO_ROOT, tree(&[("src/main.rs", "")]))
            .await
            .unwrap();
        cluster
            .copy_archive("ns", "p", "server", "/artifacts", tree(&[(SYNC_MARKER, "r3\n")]))
            .await
            .unwrap();

        assert_eq!(cluster.server_starts("ns", "p").await, 2);
        assert_eq!(*revisions.lock().unwrap(), vec!["r1", "r2"]);
        // Restarts keep the port
        assert_eq!(cluster.endpoint("ns", "p", 8080).await.unwrap().addr(), first);
    }

    #[tokio::test]
    async fn test_image_synced_pod_starts_at_creation() {
        let revisions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cluster = MockCluster::with_backend(recording_backend(revisions.clone()));
        cluster.create_pod("ns", &named("p")).await.unwrap();
        assert_eq!(cluster.server_starts("ns", "p").await, 1);
        assert!(cluster.endpoint("ns", "p", 8080).await.is_ok());

        cluster.delete_pod("ns", "p").await.unwrap();
        assert_eq!(cluster.server_starts("ns", "p").await, 0);
    }

    #[tokio::test]
    async fn test_annotations_merge() {
        let cluster = MockCluster::new();
        cluster.create_pod("ns", &named("p")).await.unwrap();
        let mut annotations = BTreeMap::new();
        annotations.insert("sync-sha".to_string(), "abc".to_string());
        cluster.annotate_pod("ns", "p", &annotations).await.unwrap();
        let pod = cluster.get_pod("ns", "p").await.unwrap().unwrap();
        assert_eq!(pod.metadata.annotations.unwrap()["sync-sha"], "abc");
    }
}
