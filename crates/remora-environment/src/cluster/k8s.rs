// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster capability backed by the Kubernetes API.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, EphemeralContainer, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Client;
use kube::api::{
    Api, AttachParams, AttachedProcess, DeleteParams, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{AuthSpec, Cluster, PodEndpoint, manifest};
use crate::error::{Error, Result};

/// Talks to the cluster of the current kubeconfig or in-cluster service account.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    in_cluster: bool,
}

impl KubeCluster {
    /// Connect using the default client configuration.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            in_cluster: std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn port_forward(&self, namespace: &str, pod: &str, port: u16) -> Result<PodEndpoint> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let pods = self.pods(namespace);
        let pod = pod.to_string();
        debug!(pod = %pod, %addr, port, "starting port-forward");

        let task = tokio::spawn(async move {
            loop {
                let (mut conn, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "port-forward listener failed");
                        return;
                    }
                };
                let pods = pods.clone();
                let pod = pod.clone();
                tokio::spawn(async move {
                    let mut forwarder = match pods.portforward(&pod, &[port]).await {
                        Ok(forwarder) => forwarder,
                        Err(e) => {
                            warn!(pod = %pod, %peer, error = %e, "port-forward failed");
                            return;
                        }
                    };
                    let Some(mut upstream) = forwarder.take_stream(port) else {
                        warn!(pod = %pod, port, "port-forward stream unavailable");
                        return;
                    };
                    if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await
                    {
                        debug!(pod = %pod, error = %e, "port-forward connection closed");
                    }
                    drop(upstream);
                    let _ = forwarder.join().await;
                });
            }
        });

        Ok(PodEndpoint::forwarded(addr, task))
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

/// Create `object` unless one with the same name exists.
async fn get_or_create<K>(api: &Api<K>, name: &str, object: &K) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    if api.get_opt(name).await?.is_none() {
        api.create(&PostParams::default(), object).await?;
        info!(name, "created cluster object");
    }
    Ok(())
}

#[async_trait]
impl Cluster for KubeCluster {
    fn cluster_type(&self) -> &'static str {
        "kube"
    }

    async fn ensure_auth(&self, namespace: &str, auth: &AuthSpec) -> Result<()> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        get_or_create(
            &accounts,
            &auth.service_account,
            &manifest::service_account(namespace),
        )
        .await?;

        // Credentials may have rotated locally; always write the latest
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut secret =
            manifest::docker_secret(namespace, &auth.docker_secret, &auth.docker_config);
        match secrets.get_opt(&auth.docker_secret).await? {
            Some(existing) => {
                secret.metadata.resource_version = existing.metadata.resource_version;
                secrets
                    .replace(&auth.docker_secret, &PostParams::default(), &secret)
                    .await?;
            }
            None => {
                secrets.create(&PostParams::default(), &secret).await?;
            }
        }

        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        get_or_create(&roles, manifest::ROLE, &manifest::role(namespace)).await?;
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        get_or_create(&bindings, manifest::ROLE, &manifest::role_binding(namespace)).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self
            .pods(namespace)
            .create(&PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api = self.config_maps(namespace);
        let name = config_map.metadata.name.clone().unwrap_or_default();
        match api.get_opt(&name).await? {
            Some(existing) => {
                let mut config_map = config_map.clone();
                config_map.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &config_map)
                    .await?;
            }
            None => {
                api.create(&PostParams::default(), config_map).await?;
            }
        }
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_ephemeral_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &EphemeralContainer,
    ) -> Result<()> {
        let patch = json!({ "spec": { "ephemeralContainers": [container] } });
        self.pods(namespace)
            .patch_ephemeral_containers(pod, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<()> {
        let params = AttachParams::default()
            .container(container)
            .stdout(false)
            .stderr(true);
        let mut attached = self.pods(namespace).exec(pod, command.clone(), &params).await?;
        finish(&mut attached, &command).await
    }

    async fn copy_archive(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        dest: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {dest} && tar xf - -C {dest}"),
        ];
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(false)
            .stderr(true);
        let mut attached = self.pods(namespace).exec(pod, command.clone(), &params).await?;

        let mut stdin = attached
            .stdin()
            .ok_or_else(|| Error::Sync("exec stdin unavailable".to_string()))?;
        stdin
            .write_all(&archive)
            .await
            .map_err(|e| Error::Sync(e.to_string()))?;
        stdin.shutdown().await.map_err(|e| Error::Sync(e.to_string()))?;
        drop(stdin);

        finish(&mut attached, &command)
            .await
            .map_err(|e| Error::Sync(e.to_string()))
    }

    async fn endpoint(&self, namespace: &str, pod: &str, port: u16) -> Result<PodEndpoint> {
        if self.in_cluster {
            let ip = self
                .get_pod(namespace, pod)
                .await?
                .and_then(|p| p.status)
                .and_then(|s| s.pod_ip)
                .ok_or_else(|| Error::Cluster(format!("pod {pod} has no IP yet")))?;
            let ip = ip
                .parse()
                .map_err(|_| Error::Cluster(format!("pod {pod} has invalid IP {ip}")))?;
            return Ok(PodEndpoint::direct(SocketAddr::new(ip, port)));
        }
        self.port_forward(namespace, pod, port).await
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let params = LogParams {
            follow: true,
            container: Some(container.to_string()),
            ..Default::default()
        };
        let lines = self
            .pods(namespace)
            .log_stream(pod, &params)
            .await?
            .lines()
            .map_err(Error::from);
        Ok(lines.boxed())
    }
}

/// Wait for an exec session and turn a non-success status into an error.
async fn finish(attached: &mut AttachedProcess, command: &[String]) -> Result<()> {
    let stderr_task = attached.stderr().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let status = match attached.take_status() {
        Some(status) => status.await,
        None => None,
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    match status {
        Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
        Some(status) => Err(Error::Cluster(format!(
            "{:?} failed: {} {}",
            command,
            status.message.unwrap_or_default(),
            stderr.trim()
        ))),
        None => Err(Error::Cluster(format!(
            "{command:?} ended without status: {}",
            stderr.trim()
        ))),
    }
}
