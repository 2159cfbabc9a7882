// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stable caller identity.
//!
//! The identity is written to the `owner` annotation of created pods and sent
//! as the `client-uuid` header on every request. Unless `REMORA_CLIENT_ID` is
//! set, a UUID is generated once and kept in `$HOME/.remora/client-id`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Environment variable overriding the persisted identity.
pub const CLIENT_ID_ENV: &str = "REMORA_CLIENT_ID";

/// `$HOME/.remora/client-id`.
pub fn default_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join(".remora")
        .join("client-id")
}

/// `REMORA_CLIENT_ID`, or the identity persisted at [`default_path`].
pub fn resolve() -> Result<String> {
    if let Some(id) = std::env::var(CLIENT_ID_ENV).ok().filter(|v| !v.is_empty()) {
        return Ok(id);
    }
    load_or_create(&default_path())
}

/// Read the identity stored at `path`, creating it on first use.
pub fn load_or_create(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &id)?;
    debug!(path = %path.display(), "generated client id");
    Ok(id)
}
