// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes objects created by the controller.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar, EnvVarSource, EphemeralContainer, HTTPGetAction, KeyToPath, ObjectFieldSelector,
    Pod, PodSpec, Probe, Secret, SecretVolumeSource, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use remora_protocol::constants::{
    ARTIFACT_URI_ENV, CONFIG_DIR, CONFIG_FILE_NAME, DOCKER_CONFIG_DIR, ENV_SHA_ENV,
    ENV_SHA_LABEL, OBJECT_URI_ENV, OWNER_ANNOTATION, POD_NAME_ENV, POD_NAMESPACE_ENV,
    REPO_NAME_ENV, REPO_NAME_LABEL, REPO_SHA_ENV, REPO_SHA_LABEL, SERVER_CONTAINER,
    SERVER_PORT, SYNC_STRATEGY_LABEL, URI_ANNOTATION,
};
use remora_protocol::{RemoteSyncStrategy, ResourceLabels, SourceStamp};
use serde_json::Value;

use crate::error::Result;

/// Service account resource pods run as.
pub const SERVICE_ACCOUNT: &str = "remora";
/// Registry credentials secret.
pub const DOCKER_SECRET: &str = "remora-dockercfg";
/// Role and RoleBinding granting pod management in the namespace.
pub const ROLE: &str = "remora";
/// Scratch directory shared between the server and the snapshot builder.
pub const SNAPSHOT_DIR: &str = "/snapshot";
/// Where the snapshot builder sees [`SNAPSHOT_DIR`].
pub const SNAPSHOT_WORKSPACE: &str = "/workspace";

const CONFIG_VOLUME: &str = "config";
const SNAPSHOT_VOLUME: &str = "snapshot";
const DOCKER_VOLUME: &str = "dockercfg";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Kubernetes names and label values are limited to 63 characters.
const MAX_NAME_LEN: usize = 63;

/// Everything needed to describe a resource pod.
#[derive(Debug, Clone)]
pub struct ResourcePod<'a> {
    /// Pod name; the params ConfigMap shares it.
    pub name: &'a str,
    /// Namespace.
    pub namespace: &'a str,
    /// Image the server container runs.
    pub image: &'a str,
    /// Caller identity written to the `owner` annotation.
    pub owner: &'a str,
    /// Strategy the pod is provisioned with.
    pub strategy: RemoteSyncStrategy,
    /// Source fingerprints injected into the server.
    pub stamp: &'a SourceStamp,
    /// Image labels copied onto the pod as annotations.
    pub labels: &'a ResourceLabels,
    /// Object identity handed to the server.
    pub object_uri: &'a str,
    /// Whether a params ConfigMap is mounted.
    pub has_params: bool,
    /// Readiness budget; sizes the startup probe.
    pub ready_timeout: Duration,
}

/// `<tag>-<5 random chars>`, sanitized and within the name limit.
pub fn pod_name(tag: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..5].to_string();
    let mut base = sanitize(tag);
    base.truncate(MAX_NAME_LEN - suffix.len() - 1);
    let base = base.trim_end_matches('-');
    format!("{base}-{suffix}")
}

/// Lowercase alphanumerics and dashes only.
fn sanitize(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

/// A valid label value: at most 63 characters, alphanumeric at both ends.
pub fn label_value(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// The pod hosting one resource server.
pub fn resource_pod(spec: &ResourcePod<'_>) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(REPO_SHA_LABEL.to_string(), label_value(&spec.stamp.repo_sha));
    labels.insert(ENV_SHA_LABEL.to_string(), label_value(&spec.stamp.env_sha));
    labels.insert(REPO_NAME_LABEL.to_string(), label_value(&spec.stamp.repo_name));
    labels.insert(
        SYNC_STRATEGY_LABEL.to_string(),
        spec.strategy.as_str().to_string(),
    );

    let mut annotations = spec.labels.as_map().clone();
    annotations.insert(URI_ANNOTATION.to_string(), spec.image.to_string());
    annotations.insert(OWNER_ANNOTATION.to_string(), spec.owner.to_string());

    let env = vec![
        field_env(POD_NAME_ENV, "metadata.name"),
        field_env(POD_NAMESPACE_ENV, "metadata.namespace"),
        value_env(OBJECT_URI_ENV, spec.object_uri),
        value_env(ARTIFACT_URI_ENV, spec.image),
        value_env(REPO_SHA_ENV, &spec.stamp.repo_sha),
        value_env(ENV_SHA_ENV, &spec.stamp.env_sha),
        value_env(REPO_NAME_ENV, &spec.stamp.repo_name),
    ];

    let mut mounts = vec![
        mount(SNAPSHOT_VOLUME, SNAPSHOT_DIR),
        mount(DOCKER_VOLUME, DOCKER_CONFIG_DIR),
    ];
    let mut volumes = vec![
        Volume {
            name: SNAPSHOT_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: DOCKER_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(DOCKER_SECRET.to_string()),
                items: Some(vec![KeyToPath {
                    key: DOCKER_CONFIG_KEY.to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    if spec.has_params {
        mounts.push(mount(CONFIG_VOLUME, CONFIG_DIR));
        volumes.push(Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: spec.name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let startup_failures = i32::try_from(spec.ready_timeout.as_secs().max(30)).unwrap_or(i32::MAX);

    let container = Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(spec.image.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(SERVER_PORT),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(mounts),
        startup_probe: Some(health_probe(1, startup_failures)),
        readiness_probe: Some(health_probe(2, 3)),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.to_string()),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn health_probe(period_seconds: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::Int(i32::from(SERVER_PORT)),
            ..Default::default()
        }),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(failure_threshold),
        success_threshold: Some(1),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// ConfigMap holding the constructor parameters as `config.json`.
pub fn params_config_map(name: &str, namespace: &str, params: &Value) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_FILE_NAME.to_string(), serde_json::to_string(params)?);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Ephemeral builder turning the snapshot workspace into a pushed image.
pub fn snapshot_container(
    name: &str,
    builder_image: &str,
    destination: &str,
    dockerfile: &str,
    labels: &ResourceLabels,
) -> EphemeralContainer {
    let mut args = vec![
        format!("--context=dir://{SNAPSHOT_WORKSPACE}"),
        format!("--dockerfile={SNAPSHOT_WORKSPACE}/{dockerfile}"),
        format!("--destination={destination}"),
        "--ignore-path=/product_uuid".to_string(),
    ];
    args.extend(
        labels
            .as_map()
            .iter()
            .map(|(key, value)| format!("--label={key}={value}")),
    );

    EphemeralContainer {
        name: name.to_string(),
        image: Some(builder_image.to_string()),
        args: Some(args),
        volume_mounts: Some(vec![
            mount(SNAPSHOT_VOLUME, SNAPSHOT_WORKSPACE),
            mount(DOCKER_VOLUME, "/kaniko/.docker"),
        ]),
        ..Default::default()
    }
}

/// Service account resource pods run as.
pub fn service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(SERVICE_ACCOUNT, namespace),
        ..Default::default()
    }
}

/// Registry credentials secret built from a local docker `config.json`.
pub fn docker_secret(namespace: &str, name: &str, docker_config: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        DOCKER_CONFIG_KEY.to_string(),
        ByteString(docker_config.to_vec()),
    );
    Secret {
        metadata: meta(name, namespace),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Role allowing the service account to manage pods in its namespace.
pub fn role(namespace: &str) -> Role {
    let verbs = ["get", "list", "watch", "create", "update", "patch", "delete"]
        .iter()
        .map(|v| v.to_string())
        .collect();
    Role {
        metadata: meta(ROLE, namespace),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![
                "pods".to_string(),
                "pods/log".to_string(),
                "pods/exec".to_string(),
                "pods/ephemeralcontainers".to_string(),
                "configmaps".to_string(),
            ]),
            verbs,
            ..Default::default()
        }]),
    }
}

/// Binds [`role`] to [`service_account`].
pub fn role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: meta(ROLE, namespace),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}
