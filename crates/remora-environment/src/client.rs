// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning orchestrator.
//!
//! [`ResourceClient::provision`] walks the states of [`ProvisionState`]:
//!
//! ```text
//! Unresolved -> Initializing -> Reusing  -> [Syncing] -> [AwaitingReady] -> Ready
//!                            \-> Building -> [Syncing] ->  AwaitingReady  -> Ready
//! ```
//!
//! `Syncing` only happens under the container strategy: a new pod is synced
//! as soon as its container runs (its entrypoint waits for the first sync), a
//! reused pod only when its `sync-sha` annotation is stale. The entrypoint
//! restarts the server after every sync, so a synced pod is ready once it
//! reports the synced revision from `info`. Anything failing after a pod was
//! created deletes the pod and its ConfigMap before the error is returned.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use remora_protocol::constants::{
    ENV_SHA_LABEL, NAME_LABEL, REPO_NAME_LABEL, REPO_ROOT, REPO_SHA_LABEL, SYNC_SHA_ANNOTATION,
};
use remora_protocol::{K8sUri, RemoteSyncStrategy, ResourceDescriptor, ResourceLabels, SourceStamp};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client_id;
use crate::cluster::manifest::{ResourcePod, params_config_map, pod_name, resource_pod};
use crate::cluster::{AuthSpec, Cluster, KubeCluster, pod_annotations, pod_is_ready};
use crate::config::Config;
use crate::engine::{ContainerEngine, DockerCli};
use crate::error::{Error, Result};
use crate::image::{BuildSpec, ImageBuildCache, ImageIdentity, RegistryClient, server_recipe};
use crate::lifecycle::{FileSyncer, PodLocator, ReadinessWaiter, SnapshotStore};
use crate::remote::RemoteResource;
use crate::scm::{GitSource, SourceControl};

/// States of one provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// Nothing resolved yet.
    Unresolved,
    /// Resolving the image identity and cluster prerequisites.
    Initializing,
    /// An existing pod serves the desired image.
    Reusing,
    /// Building the image and creating the pod.
    Building,
    /// Copying sources into the container.
    Syncing,
    /// Waiting for the readiness probe.
    AwaitingReady,
    /// The handle is usable.
    Ready,
}

impl ProvisionState {
    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Unresolved => "unresolved",
            ProvisionState::Initializing => "initializing",
            ProvisionState::Reusing => "reusing",
            ProvisionState::Building => "building",
            ProvisionState::Syncing => "syncing",
            ProvisionState::AwaitingReady => "awaiting_ready",
            ProvisionState::Ready => "ready",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to provision.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Resource type.
    pub descriptor: ResourceDescriptor,
    /// Constructor parameters, mounted as `config.json` when present.
    pub params: Option<Value>,
    /// Overrides the configured sync strategy.
    pub strategy: Option<RemoteSyncStrategy>,
    /// Prepended to the fingerprint in the image tag.
    pub tag_prefix: Option<String>,
    /// Look for an existing pod before creating one.
    pub reuse: bool,
    /// Install development dependencies in the image.
    pub dev_dependencies: bool,
}

impl ProvisionRequest {
    /// Request with reuse enabled and everything else defaulted.
    pub fn new(descriptor: ResourceDescriptor) -> Self {
        Self {
            descriptor,
            params: None,
            strategy: None,
            tag_prefix: None,
            reuse: true,
            dev_dependencies: false,
        }
    }

    /// Set constructor parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Override the sync strategy.
    pub fn with_strategy(mut self, strategy: RemoteSyncStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the tag prefix.
    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = Some(prefix.into());
        self
    }

    /// Enable or disable pod reuse.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Install development dependencies.
    pub fn with_dev_dependencies(mut self, dev: bool) -> Self {
        self.dev_dependencies = dev;
        self
    }
}

/// Pod to create for an image.
struct NewPod<'a> {
    image: &'a str,
    strategy: RemoteSyncStrategy,
    stamp: &'a SourceStamp,
    labels: &'a ResourceLabels,
    params: Option<&'a Value>,
}

/// Provisions, reuses and attaches to remote resources.
pub struct ResourceClient {
    config: Config,
    cluster: Arc<dyn Cluster>,
    source: Arc<dyn SourceControl>,
    engine: Arc<dyn ContainerEngine>,
    cache: ImageBuildCache,
    registry: RegistryClient,
    locator: PodLocator,
    syncer: FileSyncer,
    waiter: ReadinessWaiter,
    snapshots: SnapshotStore,
    client_id: String,
}

impl ResourceClient {
    /// Client over explicit capabilities.
    ///
    /// The caller identity is `config.client_id`, or the persisted id.
    pub fn new(
        config: Config,
        cluster: Arc<dyn Cluster>,
        engine: Arc<dyn ContainerEngine>,
        source: Arc<dyn SourceControl>,
    ) -> Result<Self> {
        let client_id = match &config.client_id {
            Some(id) => id.clone(),
            None => client_id::resolve()?,
        };
        Ok(Self {
            cache: ImageBuildCache::new(engine.clone(), config.image_repo.clone()),
            registry: RegistryClient::new(),
            locator: PodLocator::new(cluster.clone(), client_id.clone()),
            syncer: FileSyncer::new(cluster.clone()),
            waiter: ReadinessWaiter::new(cluster.clone(), config.poll_interval),
            snapshots: SnapshotStore::new(
                cluster.clone(),
                config.image_repo.clone(),
                config.snapshot_builder_image.clone(),
                config.snapshot_poll_interval,
            ),
            config,
            cluster,
            source,
            engine,
            client_id,
        })
    }

    /// Client from environment variables, the current kube context, the
    /// docker CLI and the git repository of the working directory.
    pub async fn from_env() -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();
        let config = Config::from_env()?;
        let cluster = Arc::new(KubeCluster::try_default().await?);
        let engine = Arc::new(DockerCli::new(config.docker_bin.clone()));
        let source = Arc::new(GitSource::discover(std::env::current_dir()?)?);
        info!(
            image_repo = %config.image_repo,
            namespace = %config.namespace,
            strategy = %config.sync_strategy,
            "resource client configured"
        );
        Self::new(config, cluster, engine, source)
    }

    /// Query registries through `registry` instead of the default client.
    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = registry;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Caller identity.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn enter(&self, state: ProvisionState, pod: Option<&str>) {
        info!(state = %state, pod = pod.unwrap_or("-"), "provisioning");
    }

    /// Provision an instance: reuse a pod serving the desired image or build
    /// the image and create one, then wait until it is ready.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<RemoteResource> {
        let namespace = self.config.namespace.as_str();
        let strategy = request.strategy.unwrap_or(self.config.sync_strategy);
        self.enter(ProvisionState::Unresolved, None);

        self.enter(ProvisionState::Initializing, None);
        let kind = self.source.project_kind()?;
        let stamp = self.source.stamp()?;
        let labels = ResourceLabels::new(&request.descriptor, &stamp);
        let identity = self
            .cache
            .identity(strategy, &stamp, request.tag_prefix.as_deref());
        let uri = identity.reference();
        debug!(uri = %uri, strategy = %strategy, kind = %kind, "resolved image identity");
        self.ensure_auth().await?;

        if request.reuse
            && let Some(pod) = self.locator.find_reusable(namespace, &uri).await?
        {
            return self.reuse(pod, strategy, &stamp).await;
        }

        self.enter(ProvisionState::Building, None);
        let server_path = request.descriptor.container_server_path();
        let source = self.source.as_ref();
        let spec = BuildSpec {
            strategy,
            stamp: &stamp,
            tag_prefix: request.tag_prefix.as_deref(),
            context: source.root(),
            labels: &labels,
            dev_dependencies: request.dev_dependencies,
        };
        self.cache
            .find_or_build(spec, |strategy, dev| {
                server_recipe(kind, strategy, source, &server_path, dev)
            })
            .await?;

        self.create(NewPod {
            image: &uri,
            strategy,
            stamp: &stamp,
            labels: &labels,
            params: request.params.as_ref(),
        })
        .await
    }

    /// Reconstruct an instance from an image URI, e.g. one returned by
    /// [`RemoteResource::store`]; `k8s://` URIs attach to the pod instead.
    ///
    /// The image must carry the labels written at build time.
    pub async fn from_uri(&self, uri: &str, params: Option<Value>) -> Result<RemoteResource> {
        if K8sUri::is_k8s(uri) {
            return self.connect(uri).await;
        }
        let namespace = self.config.namespace.as_str();
        let identity: ImageIdentity = uri.parse()?;
        let reference = identity.reference();

        self.enter(ProvisionState::Initializing, None);
        let labels = self
            .engine
            .image_labels(&reference)
            .await?
            .filter(|labels| !labels.is_empty())
            .map(ResourceLabels::from_map)
            .ok_or_else(|| Error::MissingLabels(reference.clone()))?;
        let label = |key: &str| labels.get(key).unwrap_or_default().to_string();
        let stamp = SourceStamp {
            repo_sha: label(REPO_SHA_LABEL),
            env_sha: label(ENV_SHA_LABEL),
            repo_name: label(REPO_NAME_LABEL),
        };
        self.ensure_auth().await?;

        // Images loaded by URI carry their code; nothing to sync
        let strategy = RemoteSyncStrategy::Image;
        if params.is_none()
            && let Some(pod) = self.locator.find_reusable(namespace, &reference).await?
        {
            return self.reuse(pod, strategy, &stamp).await;
        }

        self.enter(ProvisionState::Building, None);
        self.create(NewPod {
            image: &reference,
            strategy,
            stamp: &stamp,
            labels: &labels,
            params: params.as_ref(),
        })
        .await
    }

    /// Attach to a running pod given as `k8s://<namespace>/<pod>`.
    pub async fn connect(&self, process_uri: &str) -> Result<RemoteResource> {
        let process: K8sUri = process_uri.parse()?;
        RemoteResource::attach(
            self.cluster.clone(),
            self.snapshots.clone(),
            process,
            self.client_id.clone(),
        )
        .await
    }

    /// Build and push the self-contained image of a resource type without
    /// starting it.
    pub async fn store_cls(&self, descriptor: &ResourceDescriptor) -> Result<ImageIdentity> {
        let kind = self.source.project_kind()?;
        let stamp = self.source.stamp()?;
        let labels = ResourceLabels::new(descriptor, &stamp);
        let server_path = descriptor.container_server_path();
        let source = self.source.as_ref();
        let spec = BuildSpec {
            strategy: RemoteSyncStrategy::Image,
            stamp: &stamp,
            tag_prefix: None,
            context: source.root(),
            labels: &labels,
            dev_dependencies: false,
        };
        self.cache
            .find_or_build(spec, |strategy, dev| {
                server_recipe(kind, strategy, source, &server_path, dev)
            })
            .await
    }

    /// Image URIs in the configured repository whose tag mentions the type.
    pub async fn versions(&self, descriptor: &ResourceDescriptor) -> Result<Vec<String>> {
        self.registry
            .versions(&self.config.image_repo, &descriptor.short_name())
            .await
    }

    /// Search for instances by metadata. Not supported by this controller.
    pub async fn find(&self, _query: &BTreeMap<String, String>) -> Result<Vec<String>> {
        Err(Error::Unsupported("find"))
    }

    async fn ensure_auth(&self) -> Result<()> {
        let docker_config = match tokio::fs::read(&self.config.docker_config).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.config.docker_config.display(),
                    "no registry credentials found, pods pull anonymously"
                );
                b"{\"auths\":{}}".to_vec()
            }
            Err(e) => return Err(e.into()),
        };
        self.cluster
            .ensure_auth(&self.config.namespace, &AuthSpec::new(docker_config))
            .await
    }

    async fn reuse(
        &self,
        pod: Pod,
        strategy: RemoteSyncStrategy,
        stamp: &SourceStamp,
    ) -> Result<RemoteResource> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.enter(ProvisionState::Reusing, Some(&name));

        let stale = strategy == RemoteSyncStrategy::Container
            && pod_annotations(&pod).get(SYNC_SHA_ANNOTATION) != Some(&stamp.repo_sha);
        if stale {
            self.sync(&name, stamp).await?;
            self.await_ready(&name).await?;
            let handle = self.await_revision(&name, &stamp.repo_sha).await?;
            self.enter(ProvisionState::Ready, Some(&name));
            return Ok(handle);
        }
        if !pod_is_ready(&pod) {
            self.await_ready(&name).await?;
        }

        self.enter(ProvisionState::Ready, Some(&name));
        self.attach(&name).await
    }

    async fn create(&self, new: NewPod<'_>) -> Result<RemoteResource> {
        let namespace = self.config.namespace.as_str();
        let short_name = new
            .labels
            .get(NAME_LABEL)
            .unwrap_or("resource")
            .to_lowercase();
        let tag = tag_of(new.image);
        let name = if tag.starts_with(&short_name) {
            pod_name(tag)
        } else {
            pod_name(&format!("{short_name}-{tag}"))
        };

        if let Some(params) = new.params {
            let config_map = params_config_map(&name, namespace, params)?;
            self.cluster.create_config_map(namespace, &config_map).await?;
        }

        let object_uri = new.image;
        let pod = resource_pod(&ResourcePod {
            name: &name,
            namespace,
            image: new.image,
            owner: &self.client_id,
            strategy: new.strategy,
            stamp: new.stamp,
            labels: new.labels,
            object_uri,
            has_params: new.params.is_some(),
            ready_timeout: self.config.ready_timeout,
        });
        if let Err(e) = self.cluster.create_pod(namespace, &pod).await {
            self.cleanup(&name).await;
            return Err(e);
        }
        info!(pod = %name, image = %new.image, "pod created");

        match self.start(&name, new.strategy, new.stamp).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(pod = %name, error = %e, "provisioning failed, cleaning up");
                self.cleanup(&name).await;
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        name: &str,
        strategy: RemoteSyncStrategy,
        stamp: &SourceStamp,
    ) -> Result<RemoteResource> {
        if strategy == RemoteSyncStrategy::Container {
            let namespace = self.config.namespace.as_str();
            if !self
                .waiter
                .wait_running(namespace, name, self.config.ready_timeout)
                .await?
            {
                return Err(Error::PodNeverReady {
                    pod: name.to_string(),
                });
            }
            self.sync(name, stamp).await?;
            self.await_ready(name).await?;
            let handle = self.await_revision(name, &stamp.repo_sha).await?;
            self.enter(ProvisionState::Ready, Some(name));
            return Ok(handle);
        }
        self.await_ready(name).await?;
        self.enter(ProvisionState::Ready, Some(name));
        self.attach(name).await
    }

    async fn sync(&self, name: &str, stamp: &SourceStamp) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        self.enter(ProvisionState::Syncing, Some(name));
        let files = self.source.all_files()?;
        self.syncer
            .sync(
                namespace,
                name,
                &files,
                self.source.as_ref(),
                REPO_ROOT,
                &stamp.repo_sha,
            )
            .await?;

        let mut annotations = BTreeMap::new();
        annotations.insert(SYNC_SHA_ANNOTATION.to_string(), stamp.repo_sha.clone());
        self.cluster
            .annotate_pod(namespace, name, &annotations)
            .await
    }

    async fn await_ready(&self, name: &str) -> Result<()> {
        self.enter(ProvisionState::AwaitingReady, Some(name));
        let ready = self
            .waiter
            .wait_ready(&self.config.namespace, name, self.config.ready_timeout)
            .await?;
        if !ready {
            return Err(Error::PodNeverReady {
                pod: name.to_string(),
            });
        }
        Ok(())
    }

    /// Poll `info` until the server restarted over the synced tree reports
    /// `revision`. Attach failures while it restarts are retried.
    async fn await_revision(&self, name: &str, revision: &str) -> Result<RemoteResource> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            match self.attach(name).await {
                Ok(handle) => match handle.info().await {
                    Ok(info) if info.version == revision => return Ok(handle),
                    Ok(info) => {
                        debug!(pod = %name, serving = %info.version, "previous revision still serving")
                    }
                    Err(e) => debug!(pod = %name, error = %e, "server restarting"),
                },
                Err(e) => debug!(pod = %name, error = %e, "server restarting"),
            }
            if Instant::now() >= deadline {
                warn!(pod = %name, revision, "synced revision never served");
                return Err(Error::PodNeverReady {
                    pod: name.to_string(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn attach(&self, name: &str) -> Result<RemoteResource> {
        RemoteResource::attach(
            self.cluster.clone(),
            self.snapshots.clone(),
            K8sUri::new(self.config.namespace.clone(), name),
            self.client_id.clone(),
        )
        .await
    }

    async fn cleanup(&self, name: &str) {
        let namespace = self.config.namespace.as_str();
        if let Err(e) = self.cluster.delete_pod(namespace, name).await {
            warn!(pod = %name, error = %e, "failed to delete pod");
        }
        if let Err(e) = self.cluster.delete_config_map(namespace, name).await {
            warn!(pod = %name, error = %e, "failed to delete config map");
        }
    }
}

/// Tag part of an image reference.
fn tag_of(image: &str) -> &str {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[idx + 1..],
        _ => image,
    }
}
