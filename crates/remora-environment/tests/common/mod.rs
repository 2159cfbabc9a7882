// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for remora-environment E2E tests.
//!
//! Provides TestEnv: a mock cluster whose pods run real `Bar` servers on
//! ephemeral ports, a mock engine and an in-memory source tree.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use remora_environment::cluster::PodBackend;
use remora_environment::{
    Config, Error, MockCluster, MockEngine, ResourceClient, Result, StaticSource,
};
use remora_protocol::constants::{
    ARTIFACT_URI_ENV, CONFIG_FILE_NAME, ENV_SHA_ENV, OBJECT_URI_ENV, REPO_NAME_ENV, REPO_SHA_ENV,
    SERVER_CONTAINER,
};
use remora_protocol::{K8sUri, ResourceDescriptor, SourceStamp};
use remora_server::demo::Bar;
use remora_server::{Resource, ResourceServer, ServerArgs, ServerContext};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const NAMESPACE: &str = "remora-test";
pub const IMAGE_REPO: &str = "localhost:5000/remora";
pub const CLIENT_A: &str = "client-a";
pub const CLIENT_B: &str = "client-b";

/// A Rust project containing the Bar server entrypoint.
pub fn bar_source(root: &Path) -> StaticSource {
    StaticSource::new("remora")
        .with_root(root)
        .with_file("Cargo.toml", "[workspace]\nmembers = [\"crates/*\"]\n")
        .with_file("Cargo.lock", "version = 4\n")
        .with_file(Bar::SERVER_PATH, "fn main() {}\n")
}

pub fn bar_descriptor() -> ResourceDescriptor {
    Bar::descriptor()
}

/// Artifact directory the backend uses for pods running `uri`.
pub fn artifact_dir(root: &Path, uri: &str) -> PathBuf {
    let name: String = uri
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    root.join("artifacts").join(name)
}

fn container_env(pod: &Pod) -> BTreeMap<String, String> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter(|c| c.name == SERVER_CONTAINER)
        .flat_map(|c| c.env.iter().flatten())
        .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
        .collect()
}

/// Backend serving `Bar` the way the pod's server container would.
///
/// Saved state lives under [`artifact_dir`] for the pod's image, so a
/// snapshot image restores what was saved when its files are copied there.
/// The server reports the pod's `REPO_SHA` as its version.
pub fn bar_backend(root: PathBuf) -> PodBackend {
    Arc::new(
        move |pod: Pod,
              config_map: Option<ConfigMap>,
              listener: TcpListener,
              shutdown: oneshot::Receiver<()>| {
            let root = root.clone();
            async move {
                let env = container_env(&pod);
                let var = |name: &str| env.get(name).cloned().unwrap_or_default();
                let name = pod.metadata.name.clone().unwrap_or_default();
                let namespace = pod.metadata.namespace.clone().unwrap_or_default();
                let uri = var(ARTIFACT_URI_ENV);

                let context = ServerContext {
                    stamp: SourceStamp {
                        repo_sha: var(REPO_SHA_ENV),
                        env_sha: var(ENV_SHA_ENV),
                        repo_name: var(REPO_NAME_ENV),
                    },
                    object_uri: var(OBJECT_URI_ENV),
                    process_uri: K8sUri::new(namespace, &name).to_string(),
                    artifact_dir: artifact_dir(&root, &uri),
                    uri,
                };

                let config_dir = root.join("config").join(&name);
                std::fs::create_dir_all(&config_dir)?;
                if let Some(data) = config_map.and_then(|cm| cm.data)
                    && let Some(json) = data.get(CONFIG_FILE_NAME)
                {
                    std::fs::write(config_dir.join(CONFIG_FILE_NAME), json)?;
                }
                let args = ServerArgs {
                    config_dir,
                    ..Default::default()
                };
                let (bar, _) = remora_server::from_env::<Bar>(&context, &args)
                    .map_err(|e| Error::Cluster(e.to_string()))?;

                let server = ResourceServer::new(bar, context);
                let handle = tokio::spawn(async move {
                    let _ = server
                        .serve_with_shutdown(listener, async move {
                            let _ = shutdown.await;
                        })
                        .await;
                });
                Ok::<_, Error>(handle)
            }
            .boxed()
        },
    )
}

/// Fast readiness and snapshot polling, no credentials on disk.
pub fn test_config(root: &Path, client_id: &str) -> Config {
    let mut config = Config::new(IMAGE_REPO)
        .with_namespace(NAMESPACE)
        .with_readiness(Duration::from_millis(500), Duration::from_millis(10));
    config.snapshot_poll_interval = Duration::from_millis(10);
    config.docker_config = root.join("no-docker-config.json");
    config.client_id = Some(client_id.to_string());
    config
}

/// Test environment sharing one cluster and one engine between clients.
pub struct TestEnv {
    pub cluster: Arc<MockCluster>,
    pub engine: Arc<MockEngine>,
    pub root: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestEnv {
    /// Cluster whose pods serve `Bar`.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();
        let cluster = MockCluster::with_backend(bar_backend(root.clone()));
        Self::with_cluster(cluster, temp_dir)
    }

    /// Environment over a preconfigured cluster.
    pub fn with_cluster(cluster: MockCluster, temp_dir: tempfile::TempDir) -> Self {
        let root = temp_dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("src")).expect("Failed to create source root");
        Self {
            cluster: Arc::new(cluster),
            engine: Arc::new(MockEngine::new()),
            root,
            _temp_dir: temp_dir,
        }
    }

    /// Source root handed to builds.
    pub fn source_root(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn source(&self) -> StaticSource {
        bar_source(&self.source_root())
    }

    /// Client acting as `client_id` over `source`.
    pub fn client_with(&self, source: StaticSource, client_id: &str) -> ResourceClient {
        ResourceClient::new(
            test_config(&self.root, client_id),
            self.cluster.clone(),
            self.engine.clone(),
            Arc::new(source),
        )
        .expect("Failed to create client")
    }

    pub fn client(&self) -> ResourceClient {
        self.client_with(self.source(), CLIENT_A)
    }

    pub async fn pods(&self) -> Vec<String> {
        self.cluster.pod_names(NAMESPACE).await
    }

    pub async fn config_maps(&self) -> Vec<String> {
        self.cluster.config_map_names(NAMESPACE).await
    }
}

/// Unwrap the error of a result whose Ok type has no Debug.
pub fn expect_err<T>(result: Result<T>) -> Error {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    }
}
