// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote sync strategy.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// How local source changes reach a remote resource.
///
/// `Image` guarantees the running code equals the image contents. `Container`
/// builds once from the dependency manifests and then copies source edits into
/// the running container, tracking the last pushed fingerprint in the
/// `sync-sha` pod annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSyncStrategy {
    /// Every source change produces a new image.
    Image,
    /// Build dependencies once, copy source into the running container.
    #[default]
    Container,
}

impl RemoteSyncStrategy {
    /// Lowercase name used in labels and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteSyncStrategy::Image => "image",
            RemoteSyncStrategy::Container => "container",
        }
    }
}

impl std::fmt::Display for RemoteSyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RemoteSyncStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" => Ok(RemoteSyncStrategy::Image),
            "container" => Ok(RemoteSyncStrategy::Container),
            _ => Err(ProtocolError::UnknownStrategy(s.to_string())),
        }
    }
}
