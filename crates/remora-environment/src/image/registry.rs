// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry tag listing over the OCI distribution API.

use serde::Deserialize;
use tracing::debug;

use super::identity::{ImageIdentity, build_identity};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Reads tags from a registry's `/v2/<repository>/tags/list`.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    /// Client deriving the registry URL from each repository's host.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: None,
        }
    }

    /// Client sending every request to `base_url` instead.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: Some(base_url.into().trim_end_matches('/').to_string()),
        }
    }

    fn registry_url(&self, identity: &ImageIdentity) -> String {
        if let Some(base) = &self.base_url {
            return base.clone();
        }
        let host = identity.registry_host.as_str();
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{host}")
        } else if host == super::identity::DEFAULT_REGISTRY {
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{host}")
        }
    }

    /// Every tag of `repo`.
    pub async fn tags(&self, repo: &str) -> Result<Vec<String>> {
        let identity = build_identity(repo, "latest");
        let url = format!(
            "{}/v2/{}/tags/list",
            self.registry_url(&identity),
            identity.repository
        );
        debug!(%url, "listing registry tags");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
            });
        }
        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }

    /// `repo:tag` for every tag of `repo` containing `short_name`.
    pub async fn versions(&self, repo: &str, short_name: &str) -> Result<Vec<String>> {
        let identity = build_identity(repo, "latest");
        Ok(self
            .tags(repo)
            .await?
            .into_iter()
            .filter(|tag| tag.contains(short_name))
            .map(|tag| format!("{}:{}", identity.repository_reference(), tag))
            .collect())
    }
}
