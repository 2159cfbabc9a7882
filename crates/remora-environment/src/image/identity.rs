// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed image identities.
//!
//! Tags are derived from source fingerprints, never chosen by the caller, so
//! two builds of an unchanged tree under the same strategy resolve to the same
//! image and the second one is a cache hit.

use std::fmt;
use std::str::FromStr;

use remora_protocol::{RemoteSyncStrategy, SourceStamp};

use crate::error::Error;

/// Registry assumed when a repository has no explicit host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Where an image lives and which revision it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageIdentity {
    /// Registry host, e.g. `ghcr.io` or `localhost:5000`.
    pub registry_host: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Image tag.
    pub tag: String,
}

impl ImageIdentity {
    /// `host/repository`, or just `repository` on the default registry.
    pub fn repository_reference(&self) -> String {
        if self.registry_host == DEFAULT_REGISTRY {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry_host, self.repository)
        }
    }

    /// Full reference as listed by the container engine.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository_reference(), self.tag)
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

impl FromStr for ImageIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // A ':' after the last '/' separates the tag; earlier ones are ports
        let (repo, tag) = match s.rfind(':') {
            Some(idx) if !s[idx..].contains('/') => (&s[..idx], &s[idx + 1..]),
            _ => (s, "latest"),
        };
        if repo.is_empty() || tag.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }
        Ok(build_identity(repo, tag))
    }
}

/// Tag for a source revision under a strategy.
///
/// `Image` keys on the full source fingerprint, `Container` on the dependency
/// fingerprint only.
pub fn compute_tag(
    strategy: RemoteSyncStrategy,
    stamp: &SourceStamp,
    prefix: Option<&str>,
) -> String {
    let hash = match strategy {
        RemoteSyncStrategy::Image => &stamp.repo_sha,
        RemoteSyncStrategy::Container => &stamp.env_sha,
    };
    format!("{}{}", prefix.unwrap_or_default(), hash)
}

/// Split `repo` into registry host and repository path and attach `tag`.
///
/// The first path component is a host when it contains `.` or `:` or is
/// `localhost`; otherwise the image lives on [`DEFAULT_REGISTRY`].
pub fn build_identity(repo: &str, tag: &str) -> ImageIdentity {
    let repo = repo.trim_end_matches('/');
    let (registry_host, repository) = match repo.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), repo.to_string()),
    };
    ImageIdentity {
        registry_host,
        repository,
        tag: tag.to_string(),
    }
}
