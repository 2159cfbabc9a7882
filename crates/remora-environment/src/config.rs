// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for remora-environment.

use std::path::PathBuf;
use std::time::Duration;

use remora_protocol::RemoteSyncStrategy;

/// Default namespace resource pods are created in.
pub const DEFAULT_NAMESPACE: &str = "remora";

/// Default image of the ephemeral snapshot builder.
pub const DEFAULT_SNAPSHOT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry host and repository path images are pushed to
    pub image_repo: String,
    /// Namespace pods are created in
    pub namespace: String,
    /// Default sync strategy for provisioning
    pub sync_strategy: RemoteSyncStrategy,
    /// Container engine CLI
    pub docker_bin: String,
    /// Registry credentials copied into the cluster secret
    pub docker_config: PathBuf,
    /// How long to wait for a pod to become ready
    pub ready_timeout: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
    /// Snapshot builder poll interval
    pub snapshot_poll_interval: Duration,
    /// Image of the ephemeral snapshot builder
    pub snapshot_builder_image: String,
    /// Caller identity written to the `owner` annotation (None = persisted id)
    pub client_id: Option<String>,
}

impl Config {
    /// Configuration with defaults for everything but the image repository.
    pub fn new(image_repo: impl Into<String>) -> Self {
        Self {
            image_repo: image_repo.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            sync_strategy: RemoteSyncStrategy::default(),
            docker_bin: "docker".to_string(),
            docker_config: default_docker_config(),
            ready_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            snapshot_poll_interval: Duration::from_millis(1000),
            snapshot_builder_image: DEFAULT_SNAPSHOT_BUILDER_IMAGE.to_string(),
            client_id: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let image_repo = std::env::var("REMORA_IMAGE_REPO")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEnvVar("REMORA_IMAGE_REPO"))?;

        let mut config = Self::new(image_repo);

        if let Ok(namespace) = std::env::var("REMORA_KUBE_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Ok(strategy) = std::env::var("REMORA_REMOTE_SYNC_STRATEGY") {
            config.sync_strategy = strategy
                .parse()
                .map_err(|_| ConfigError::UnknownStrategy(strategy))?;
        }

        if let Ok(bin) = std::env::var("REMORA_DOCKER_BIN") {
            config.docker_bin = bin;
        }

        if let Ok(path) = std::env::var("REMORA_DOCKER_CONFIG") {
            config.docker_config = PathBuf::from(path);
        }

        if let Some(secs) = parse_var("REMORA_READY_TIMEOUT_SECS")? {
            config.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var("REMORA_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("REMORA_SNAPSHOT_POLL_INTERVAL_MS")? {
            config.snapshot_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(image) = std::env::var("REMORA_SNAPSHOT_BUILDER_IMAGE") {
            config.snapshot_builder_image = image;
        }

        config.client_id = std::env::var("REMORA_CLIENT_ID")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(config)
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default sync strategy.
    pub fn with_sync_strategy(mut self, strategy: RemoteSyncStrategy) -> Self {
        self.sync_strategy = strategy;
        self
    }

    /// Set the readiness budget and poll interval.
    pub fn with_readiness(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.ready_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }
}

fn parse_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: name, value }),
        Err(_) => Ok(None),
    }
}

fn default_docker_config() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".docker")
        .join("config.json")
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The sync strategy is not `image` or `container`.
    #[error("Unknown sync strategy: {0}")]
    UnknownStrategy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("ghcr.io/acme/resources");
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.sync_strategy, RemoteSyncStrategy::Container);
        assert_eq!(config.ready_timeout, Duration::from_secs(300));
        assert!(config.docker_config.ends_with(".docker/config.json"));
    }

    #[test]
    fn test_builders_override() {
        let config = Config::new("reg/repo")
            .with_namespace("dev")
            .with_sync_strategy(RemoteSyncStrategy::Image)
            .with_readiness(Duration::from_secs(2), Duration::from_millis(10));
        assert_eq!(config.namespace, "dev");
        assert_eq!(config.sync_strategy, RemoteSyncStrategy::Image);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }
}
