// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/WebSocket surface of a hosted resource.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use remora_protocol::constants::{
    ARTIFACT_DIR, ARTIFACT_URI_ENV, CLIENT_UUID_HEADER, ENV_SHA_ENV, OBJECT_URI_ENV,
    POD_NAME_ENV, POD_NAMESPACE_ENV, REPO_NAME_ENV, REPO_SHA_ENV,
};
use remora_protocol::{
    Envelope, HealthStatus, InfoResponse, K8sUri, LockRequest, ResourceDescriptor,
    ResourceLabels, SourceStamp, StreamFrame, UnlockRequest,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{ResourceError, Result};
use crate::lock::{LockError, LockState};
use crate::logs::LogBuffer;
use crate::resource::{ItemStream, Resource, Route, RouteTable};

/// Environment variable overriding where saved state is written.
pub const ARTIFACT_DIR_ENV: &str = "REMORA_ARTIFACT_DIR";

/// Identity of the running process, reported by `info` and `labels`.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Source fingerprint the process was provisioned from.
    pub stamp: SourceStamp,
    /// Image URI of the resource.
    pub uri: String,
    /// Object identity handed to the process.
    pub object_uri: String,
    /// `k8s://<ns>/<pod>` inside a pod, `local://<pid>` otherwise.
    pub process_uri: String,
    /// Where `save` writes and `load` reads.
    pub artifact_dir: PathBuf,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self {
            stamp: SourceStamp::default(),
            uri: String::new(),
            object_uri: String::new(),
            process_uri: local_process_uri(),
            artifact_dir: PathBuf::from(ARTIFACT_DIR),
        }
    }
}

impl ServerContext {
    /// Read the context injected into the pod.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let uri = var(ARTIFACT_URI_ENV).unwrap_or_default();
        let object_uri = var(OBJECT_URI_ENV).unwrap_or_else(|| uri.clone());
        let process_uri = match (var(POD_NAMESPACE_ENV), var(POD_NAME_ENV)) {
            (Some(namespace), Some(name)) => K8sUri::new(namespace, name).to_string(),
            _ => local_process_uri(),
        };

        Self {
            stamp: SourceStamp {
                repo_sha: var(REPO_SHA_ENV).unwrap_or_default(),
                env_sha: var(ENV_SHA_ENV).unwrap_or_default(),
                repo_name: var(REPO_NAME_ENV).unwrap_or_default(),
            },
            uri,
            object_uri,
            process_uri,
            artifact_dir: PathBuf::from(
                var(ARTIFACT_DIR_ENV).unwrap_or_else(|| ARTIFACT_DIR.to_string()),
            ),
        }
    }
}

fn local_process_uri() -> String {
    format!("local://{}", std::process::id())
}

/// File a resource type's state is saved to.
pub fn artifact_path<R: Resource>(dir: &Path) -> PathBuf {
    dir.join(format!("{}.json", R::NAME.to_lowercase()))
}

/// Hosts one resource instance.
pub struct ResourceServer<R: Resource> {
    resource: R,
    context: ServerContext,
    logs: LogBuffer,
}

impl<R: Resource> ResourceServer<R> {
    /// Host `resource` with the given identity.
    pub fn new(resource: R, context: ServerContext) -> Self {
        Self {
            resource,
            context,
            logs: LogBuffer::default(),
        }
    }

    /// Serve `WS /logs` from this buffer.
    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    /// Build the router: fixed routes first, then one route per registered method.
    pub fn into_router(self) -> Router {
        let state = Arc::new(ServerState {
            resource: tokio::sync::Mutex::new(self.resource),
            lock: Mutex::new(LockState::default()),
            routes: RouteTable::<R>::for_resource(),
            streams: Arc::new(Semaphore::new(1)),
            descriptor: R::descriptor(),
            context: self.context,
            logs: self.logs,
        });

        let mut router: Router<Shared<R>> = Router::new()
            .route("/health", get(health).post(health))
            .route("/info", get(info_handler::<R>).post(info_handler::<R>))
            .route("/labels", get(labels::<R>).post(labels::<R>))
            .route("/schema", get(schema::<R>).post(schema::<R>))
            .route("/lock", post(lock::<R>))
            .route("/unlock", post(unlock::<R>))
            .route("/save", post(save::<R>))
            .route("/load", post(load::<R>))
            .route("/diff", post(not_implemented_diff))
            .route("/merge", post(not_implemented_merge))
            .route("/logs", get(logs::<R>));

        for (name, route) in state.routes.iter() {
            let path = format!("/{name}");
            let method = name.to_string();
            router = match route {
                Route::Call(_) => router.route(
                    &path,
                    post(
                        move |State(state): State<Shared<R>>, headers: HeaderMap, body: Bytes| {
                            let method = method.clone();
                            async move { call_method(state, &method, headers, body).await }
                        },
                    ),
                ),
                Route::Stream(_) => router.route(
                    &path,
                    get(
                        move |State(state): State<Shared<R>>,
                              headers: HeaderMap,
                              Query(query): Query<StreamQuery>,
                              ws: WebSocketUpgrade| {
                            let method = method.clone();
                            async move { open_stream(state, method, headers, query, ws).await }
                        },
                    ),
                ),
            };
        }

        info!(
            resource = R::NAME,
            methods = state.routes.len(),
            "resource routes registered"
        );

        router.layer(TraceLayer::new_for_http()).with_state(state)
    }

    /// Serve on `listener` until the connection loop ends.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve on `listener` until `signal` resolves, then close idle
    /// connections and wait for in-flight requests.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        signal: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(resource = R::NAME, %addr, "resource server listening");
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(signal)
            .await?;
        info!(resource = R::NAME, %addr, "resource server shut down");
        Ok(())
    }
}

type Shared<R> = Arc<ServerState<R>>;

struct ServerState<R> {
    resource: tokio::sync::Mutex<R>,
    lock: Mutex<LockState>,
    routes: RouteTable<R>,
    streams: Arc<Semaphore>,
    descriptor: ResourceDescriptor,
    context: ServerContext,
    logs: LogBuffer,
}

impl<R: Resource> ServerState<R> {
    fn check_lock(&self, client: &str) -> Result<()> {
        let state = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.check(client).map_err(|e| {
            debug!(client, "call rejected, resource is locked");
            ResourceError::from(e)
        })
    }

    fn with_lock_state<T>(
        &self,
        f: impl FnOnce(&mut LockState) -> std::result::Result<T, LockError>,
    ) -> Result<T> {
        let mut state = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state)?)
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    data: Option<String>,
}

fn client_id(headers: &HeaderMap) -> Result<String> {
    headers
        .get(CLIENT_UUID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ResourceError::MissingClientId)
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ResourceError::BadRequest(e.to_string()))
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus::ok())
}

async fn info_handler<R: Resource>(State(state): State<Shared<R>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: R::NAME.to_string(),
        version: state.context.stamp.repo_sha.clone(),
        env_sha: state.context.stamp.env_sha.clone(),
        uri: state.context.uri.clone(),
    })
}

async fn labels<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
) -> Result<Json<ResourceLabels>> {
    client_id(&headers)?;
    Ok(Json(ResourceLabels::new(
        &state.descriptor,
        &state.context.stamp,
    )))
}

async fn schema<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    client_id(&headers)?;
    Ok(Json(state.descriptor.params_schema.clone()))
}

async fn lock<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Envelope<()>>> {
    let client = client_id(&headers)?;
    let req: LockRequest = parse_body(&body)?;
    let keyed = req.key.is_some();
    state.with_lock_state(|s| s.lock(&client, req.key, req.timeout))?;
    info!(client, keyed, timeout = ?req.timeout, "resource locked");
    Ok(Json(Envelope::new(())))
}

async fn unlock<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Envelope<()>>> {
    let client = client_id(&headers)?;
    let req: UnlockRequest = parse_body(&body)?;
    state.with_lock_state(|s| s.unlock(req.key.as_deref(), req.force))?;
    info!(client, force = req.force, "resource unlocked");
    Ok(Json(Envelope::new(())))
}

async fn save<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
) -> Result<Json<Envelope<String>>> {
    let client = client_id(&headers)?;
    state.check_lock(&client)?;

    let bytes = {
        let resource = state.resource.lock().await;
        serde_json::to_vec_pretty(&*resource)?
    };
    let path = artifact_path::<R>(&state.context.artifact_dir);
    tokio::fs::create_dir_all(&state.context.artifact_dir).await?;
    tokio::fs::write(&path, bytes).await?;

    info!(path = %path.display(), "resource state saved");
    Ok(Json(Envelope::new(path.display().to_string())))
}

async fn load<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
) -> Result<Json<Envelope<()>>> {
    let client = client_id(&headers)?;
    state.check_lock(&client)?;

    let path = artifact_path::<R>(&state.context.artifact_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResourceError::NoArtifact(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let loaded: R = serde_json::from_slice(&bytes)?;
    *state.resource.lock().await = loaded;

    info!(path = %path.display(), "resource state loaded");
    Ok(Json(Envelope::new(())))
}

async fn not_implemented_diff(headers: HeaderMap) -> Result<Json<Value>> {
    client_id(&headers)?;
    Err(ResourceError::NotImplemented("diff"))
}

async fn not_implemented_merge(headers: HeaderMap) -> Result<Json<Value>> {
    client_id(&headers)?;
    Err(ResourceError::NotImplemented("merge"))
}

async fn call_method<R: Resource>(
    state: Shared<R>,
    method: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let client = client_id(&headers)?;
    state.check_lock(&client)?;

    let args: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ResourceError::BadRequest(e.to_string()))?
    };
    let Some(Route::Call(f)) = state.routes.get(method) else {
        return Err(ResourceError::UnknownMethod(method.to_string()));
    };

    let mut resource = state.resource.lock().await;
    debug!(method, client, "calling method");
    Ok(Json(f(&mut *resource, args)?))
}

async fn open_stream<R: Resource>(
    state: Shared<R>,
    method: String,
    headers: HeaderMap,
    query: StreamQuery,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let client = client_id(&headers)?;
    state.check_lock(&client)?;

    let permit = Arc::clone(&state.streams)
        .try_acquire_owned()
        .map_err(|_| ResourceError::StreamBusy)?;

    let args: Value = match query.data.as_deref() {
        Some(data) => {
            serde_json::from_str(data).map_err(|e| ResourceError::BadRequest(e.to_string()))?
        }
        None => Value::Null,
    };
    let Some(Route::Stream(f)) = state.routes.get(&method) else {
        return Err(ResourceError::UnknownMethod(method));
    };

    let items = {
        let mut resource = state.resource.lock().await;
        f(&mut *resource, args)?
    };

    info!(method = %method, client, "stream opened");
    Ok(ws.on_upgrade(move |socket| async move {
        send_items(socket, items).await;
        drop(permit);
        debug!(method = %method, "stream closed");
    }))
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(_) => return false,
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn send_items(mut socket: WebSocket, items: ItemStream) {
    for item in items {
        let frame = match item {
            Ok(value) => StreamFrame::item(value),
            Err(e) => {
                let _ = send_frame(&mut socket, &StreamFrame::Error {
                    error: e.to_string(),
                })
                .await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };
        if !send_frame(&mut socket, &frame).await {
            debug!("stream client went away");
            return;
        }
    }
    let _ = send_frame(&mut socket, &StreamFrame::end()).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn logs<R: Resource>(
    State(state): State<Shared<R>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    client_id(&headers)?;
    let buffer = state.logs.clone();
    Ok(ws.on_upgrade(move |socket| follow_logs(socket, buffer)))
}

async fn follow_logs(mut socket: WebSocket, buffer: LogBuffer) {
    let mut live = buffer.subscribe();
    for line in buffer.snapshot() {
        if !send_frame(&mut socket, &StreamFrame::item(Value::String(line))).await {
            return;
        }
    }
    loop {
        tokio::select! {
            line = live.recv() => match line {
                Ok(line) => {
                    if !send_frame(&mut socket, &StreamFrame::item(Value::String(line))).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = send_frame(&mut socket, &StreamFrame::end()).await;
    let _ = socket.send(Message::Close(None)).await;
}
