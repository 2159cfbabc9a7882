// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed names shared by the controller and the resource server.

/// Port every resource server listens on inside its pod.
pub const SERVER_PORT: u16 = 8080;

/// Name of the server container in a resource pod.
pub const SERVER_CONTAINER: &str = "server";

/// Header identifying the calling client on every request.
pub const CLIENT_UUID_HEADER: &str = "client-uuid";

// Pod annotations

/// Image URI the pod was created from.
pub const URI_ANNOTATION: &str = "uri";
/// Identity of the caller that created the pod.
pub const OWNER_ANNOTATION: &str = "owner";
/// Source fingerprint last pushed into the container (container strategy only).
pub const SYNC_SHA_ANNOTATION: &str = "sync-sha";

// Image labels, copied onto pods as annotations

/// JSON list of the resource's base type names.
pub const BASES_LABEL: &str = "bases";
/// Resource type name.
pub const NAME_LABEL: &str = "name";
/// Source fingerprint of the build.
pub const VERSION_LABEL: &str = "version";
/// JSON schema of the resource's constructor parameters.
pub const PARAMS_SCHEMA_LABEL: &str = "params-schema";
/// Path of the server entrypoint inside the image.
pub const SERVER_PATH_LABEL: &str = "server-path";

// Pod labels

/// Full source fingerprint.
pub const REPO_SHA_LABEL: &str = "repo-sha";
/// Dependency-only fingerprint.
pub const ENV_SHA_LABEL: &str = "env-sha";
/// Source repository name.
pub const REPO_NAME_LABEL: &str = "repo-name";
/// Sync strategy the pod was provisioned with.
pub const SYNC_STRATEGY_LABEL: &str = "sync-strategy";

// Mounts and files

/// Repository root inside images.
pub const REPO_ROOT: &str = "/app";
/// File under [`REPO_ROOT`] holding the revision of the last sync. The
/// container strategy entrypoint restarts the server whenever it changes.
pub const SYNC_MARKER: &str = ".remora-sync";
/// Directory the constructor-parameter ConfigMap is mounted at.
pub const CONFIG_DIR: &str = "/config";
/// Key of the ConfigMap entry holding constructor parameters.
pub const CONFIG_FILE_NAME: &str = "config.json";
/// Directory saved resource state is written to.
pub const ARTIFACT_DIR: &str = "/artifacts";
/// Mount path of the registry credentials secret.
pub const DOCKER_CONFIG_DIR: &str = "/root/.docker";

// Environment variables read by the server bootstrap

/// Log filter for the resource server.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
/// Overrides the image URI the server reports.
pub const ARTIFACT_URI_ENV: &str = "ARTIFACT_URI";
/// Pod name (downward API).
pub const POD_NAME_ENV: &str = "POD_NAME";
/// Pod namespace (downward API).
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Object identity passed to the running process.
pub const OBJECT_URI_ENV: &str = "OBJECT_URI";
/// Full source fingerprint the pod was provisioned from.
pub const REPO_SHA_ENV: &str = "REPO_SHA";
/// Dependency fingerprint the pod was provisioned from.
pub const ENV_SHA_ENV: &str = "ENV_SHA";
/// Repository name the pod was provisioned from.
pub const REPO_NAME_ENV: &str = "REPO_NAME";
