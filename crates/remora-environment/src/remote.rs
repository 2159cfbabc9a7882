// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle to a running resource.
//!
//! Unary methods travel as `POST /<method>` with a JSON body; methods that
//! yield items are read from `WS /<method>?data=<json args>` until the end
//! frame. Every request carries the caller's `client-uuid`; the server records
//! the caller that locks an instance as its holder, so the holder can keep
//! using it with or without a key.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use remora_protocol::constants::{
    CLIENT_UUID_HEADER, NAME_LABEL, SERVER_CONTAINER, SERVER_PORT, VERSION_LABEL,
};
use remora_protocol::{
    Envelope, ErrorBody, HealthStatus, InfoResponse, K8sUri, LockRequest, NoArgs,
    ResourceLabels, StreamFrame, UnlockRequest,
};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};
use url::Url;

use crate::cluster::{Cluster, PodEndpoint};
use crate::error::{Error, Result};
use crate::image::ImageIdentity;
use crate::lifecycle::{SnapshotRequest, SnapshotStore};

/// A ready resource instance in a pod.
///
/// Dropping the handle leaves the pod running; [`RemoteResource::delete`]
/// removes it.
pub struct RemoteResource {
    http: reqwest::Client,
    base: Url,
    _endpoint: PodEndpoint,
    client_id: String,
    process: K8sUri,
    uri: String,
    labels: ResourceLabels,
    cluster: Arc<dyn Cluster>,
    snapshots: SnapshotStore,
}

impl std::fmt::Debug for RemoteResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResource")
            .field("process", &self.process.to_string())
            .field("uri", &self.uri)
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl RemoteResource {
    /// Attach to the server of `process` and read its identity.
    pub async fn attach(
        cluster: Arc<dyn Cluster>,
        snapshots: SnapshotStore,
        process: K8sUri,
        client_id: impl Into<String>,
    ) -> Result<Self> {
        let client_id = client_id.into();
        let endpoint = cluster
            .endpoint(&process.namespace, &process.name, SERVER_PORT)
            .await?;
        let base = Url::parse(&format!("http://{}/", endpoint.addr()))
            .map_err(|e| Error::InvalidUri(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CLIENT_UUID_HEADER,
            HeaderValue::from_str(&client_id)
                .map_err(|e| Error::InvalidUri(format!("client id {client_id}: {e}")))?,
        );
        let http = reqwest::Client::builder().default_headers(headers).build()?;

        let mut handle = Self {
            http,
            base,
            _endpoint: endpoint,
            client_id,
            process,
            uri: String::new(),
            labels: ResourceLabels::default(),
            cluster,
            snapshots,
        };
        handle.uri = handle.info().await?.uri;
        handle.labels = handle.call_mapping("labels", &NoArgs {}).await?;
        debug!(process = %handle.process, uri = %handle.uri, "attached to resource");
        Ok(handle)
    }

    fn url(&self, method: &str) -> Result<Url> {
        self.base
            .join(method)
            .map_err(|e| Error::InvalidUri(format!("{method}: {e}")))
    }

    async fn post<A>(&self, method: &str, args: &A) -> Result<reqwest::Response>
    where
        A: Serialize + ?Sized,
    {
        let response = self.http.post(self.url(method)?).json(args).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(status_error(status, message))
    }

    /// Call a method returning a value wrapped as `{"response": value}`.
    pub async fn call<A, T>(&self, method: &str, args: &A) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let envelope: Envelope<T> = self.post(method, args).await?.json().await?;
        Ok(envelope.response)
    }

    /// Call a method whose return value is a mapping, sent unwrapped.
    pub async fn call_mapping<A, T>(&self, method: &str, args: &A) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        Ok(self.post(method, args).await?.json().await?)
    }

    /// Open a streaming method and yield its items in order.
    ///
    /// The stream ends at the server's end frame. An error frame is yielded
    /// as one final `Err`.
    pub async fn stream<A, T>(
        &self,
        method: &str,
        args: &A,
    ) -> Result<BoxStream<'static, Result<T>>>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        let mut url = self.url(method)?;
        url.set_scheme("ws")
            .map_err(|_| Error::InvalidUri(url.to_string()))?;
        url.query_pairs_mut()
            .append_pair("data", &serde_json::to_string(args)?);

        let mut request = url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(&self.client_id)
            .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
        request.headers_mut().insert(CLIENT_UUID_HEADER, header);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        debug!(method, "stream opened");

        let items = stream::unfold(Some(socket), |socket| async move {
            let Some(mut socket) = socket else {
                return None;
            };
            loop {
                let message = match socket.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Some((Err(Error::from(e)), None)),
                    None => return None,
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => return None,
                    _ => continue,
                };
                match StreamFrame::parse(text.as_str()) {
                    Ok(StreamFrame::Item { response }) => {
                        let item = serde_json::from_value(response).map_err(Error::from);
                        return Some((item, Some(socket)));
                    }
                    Ok(StreamFrame::End { .. }) => {
                        let _ = socket.close(None).await;
                        return None;
                    }
                    Ok(StreamFrame::Error { error }) => {
                        let err = Error::Remote {
                            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                            message: error,
                        };
                        return Some((Err(err), None));
                    }
                    Err(e) => return Some((Err(e.into()), None)),
                }
            }
        });
        Ok(items.boxed())
    }

    /// Name, version, env-sha and image URI reported by the server.
    pub async fn info(&self) -> Result<InfoResponse> {
        self.call_mapping("info", &NoArgs {}).await
    }

    /// `{"health": "ok"}` while serving.
    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self.http.get(self.url("health")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        Ok(response.json().await?)
    }

    /// JSON schema of the constructor parameters.
    pub async fn schema(&self) -> Result<Value> {
        self.call_mapping("schema", &NoArgs {}).await
    }

    /// Lock the instance.
    ///
    /// The server records this caller's id as the holder, so calls from this
    /// handle keep working while every other caller gets [`Error::Locked`].
    /// `key`, when given, is required to unlock. Fails with
    /// [`Error::LockConflict`] while an unexpired lock exists.
    pub async fn lock(&self, key: Option<&str>, timeout: Option<Duration>) -> Result<()> {
        let request = LockRequest {
            key: key.map(str::to_string),
            timeout: timeout.map(|t| t.as_secs()),
        };
        match self.call::<_, Value>("lock", &request).await {
            Ok(_) => Ok(()),
            Err(Error::Remote { status: 409, message }) => Err(Error::LockConflict(message)),
            Err(e) => Err(e),
        }
    }

    /// Release the lock.
    ///
    /// Succeeds when nothing is locked, the lock expired or it has no key.
    /// Fails with [`Error::LockForbidden`] when the key differs and `force`
    /// is not set.
    pub async fn unlock(&self, key: Option<&str>, force: bool) -> Result<()> {
        let request = UnlockRequest {
            key: key.map(str::to_string),
            force,
        };
        self.call::<_, Value>("unlock", &request).await?;
        Ok(())
    }

    /// Persist the instance's state inside the pod; returns the artifact path.
    pub async fn save(&self) -> Result<String> {
        self.call("save", &NoArgs {}).await
    }

    /// Restore the instance's state saved inside the pod.
    pub async fn load(&self) -> Result<()> {
        self.call::<_, Value>("load", &NoArgs {}).await?;
        Ok(())
    }

    /// Difference to another stored instance. Not implemented by servers.
    pub async fn diff(&self, other: &str) -> Result<Value> {
        self.call("diff", &json!({ "other": other })).await
    }

    /// Merge another stored instance. Not implemented by servers.
    pub async fn merge(&self, other: &str) -> Result<Value> {
        self.call("merge", &json!({ "other": other })).await
    }

    /// Recent and live log lines of the server process.
    pub async fn logs(&self) -> Result<BoxStream<'static, Result<String>>> {
        self.stream("logs", &NoArgs {}).await
    }

    /// Follow the server container's log through the cluster.
    pub async fn pod_logs(&self) -> Result<BoxStream<'static, Result<String>>> {
        self.cluster
            .pod_logs(&self.process.namespace, &self.process.name, SERVER_CONTAINER)
            .await
    }

    /// Save the state and snapshot the pod into a new image.
    ///
    /// The returned image can be passed to `ResourceClient::from_uri`.
    pub async fn store(&self) -> Result<ImageIdentity> {
        let artifact = self.save().await?;
        debug!(artifact = %artifact, "state saved for snapshot");

        let short_name = self
            .labels
            .get(NAME_LABEL)
            .map(str::to_lowercase)
            .ok_or_else(|| Error::MissingLabels(self.uri.clone()))?;
        let version = self.labels.get(VERSION_LABEL).unwrap_or_default();
        self.snapshots
            .snapshot(SnapshotRequest {
                namespace: &self.process.namespace,
                pod: &self.process.name,
                base_image: &self.uri,
                short_name: &short_name,
                version,
                labels: &self.labels,
            })
            .await
    }

    /// `k8s://<namespace>/<pod>`.
    pub fn process_uri(&self) -> String {
        self.process.to_string()
    }

    /// Location of the pod.
    pub fn process(&self) -> &K8sUri {
        &self.process
    }

    /// Image URI the instance runs.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Image labels of the resource type, as reported when attaching.
    pub fn labels(&self) -> &ResourceLabels {
        &self.labels
    }

    /// Id sent as `client-uuid`.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Delete the pod and its params ConfigMap.
    pub async fn delete(self) -> Result<()> {
        let K8sUri { namespace, name } = &self.process;
        self.cluster.delete_pod(namespace, name).await?;
        self.cluster.delete_config_map(namespace, name).await?;
        info!(process = %self.process, "resource deleted");
        Ok(())
    }
}

/// Map a server error status onto the controller taxonomy.
fn status_error(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::FORBIDDEN => Error::LockForbidden(message),
        StatusCode::LOCKED => Error::Locked(message),
        StatusCode::NOT_IMPLEMENTED => Error::NotImplemented(message),
        _ => Error::Remote {
            status: status.as_u16(),
            message,
        },
    }
}

fn handshake_error(err: tungstenite::Error) -> Error {
    if let tungstenite::Error::Http(response) = &err {
        let text = response
            .body()
            .as_ref()
            .map(|body| String::from_utf8_lossy(&body[..]).into_owned())
            .unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return status_error(status, message);
    }
    Error::from(err)
}
