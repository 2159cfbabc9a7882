// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance-wide mutual exclusion.
//!
//! A resource instance holds at most one [`Lock`]. Locking fails while an
//! unexpired lock exists. The `client-uuid` that took the lock is recorded as
//! its holder, separately from the optional key. Business calls are admitted
//! when the instance is unlocked, the lock has expired, or the caller is the
//! holder or presents the key as its `client-uuid`.
//!
//! A timeout too large to represent never expires.
//!
//! | Existing lock            | `unlock(key, force)` |
//! |--------------------------|----------------------|
//! | none                     | ok                   |
//! | expired                  | ok                   |
//! | no key                   | ok                   |
//! | key matches              | ok                   |
//! | key differs, `force`     | ok                   |
//! | key differs, no `force`  | forbidden            |

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lock failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// An unexpired lock is already held.
    #[error("Lock conflict: resource is already locked")]
    Conflict,
    /// Unlock attempted with the wrong key and without `force`.
    #[error("Forbidden: lock key does not match")]
    Forbidden,
    /// A call was rejected because the resource is locked by someone else.
    #[error("Resource is locked")]
    Locked,
}

/// A lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// When the lock was taken.
    pub created: DateTime<Utc>,
    /// Key required to unlock.
    pub key: Option<String>,
    /// `client-uuid` of the caller that took the lock.
    #[serde(default)]
    pub holder: Option<String>,
    /// Seconds after `created` at which the lock lapses.
    pub timeout: Option<u64>,
}

impl Lock {
    /// Take a lock now.
    pub fn new(key: Option<String>, timeout: Option<u64>) -> Self {
        Self {
            created: Utc::now(),
            key,
            holder: None,
            timeout,
        }
    }

    /// Record the caller that took the lock.
    pub fn held_by(mut self, client: impl Into<String>) -> Self {
        self.holder = Some(client.into());
        self
    }

    /// Lifetime of the lock, `None` when it never lapses.
    pub fn lifetime(&self) -> Option<TimeDelta> {
        let secs = i64::try_from(self.timeout?).ok()?;
        TimeDelta::try_seconds(secs)
    }

    /// Whether the lock has lapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the lock has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.lifetime() {
            Some(lifetime) => now.signed_duration_since(self.created) > lifetime,
            None => false,
        }
    }

    fn key_matches(&self, key: Option<&str>) -> bool {
        match (&self.key, key) {
            (Some(held), Some(given)) => held == given,
            _ => false,
        }
    }

    fn admits(&self, client: &str) -> bool {
        self.holder.as_deref() == Some(client) || self.key_matches(Some(client))
    }
}

/// The lock slot of one resource instance.
#[derive(Debug, Default)]
pub struct LockState {
    current: Option<Lock>,
}

impl LockState {
    /// Current lock, if any (expired or not).
    pub fn current(&self) -> Option<&Lock> {
        self.current.as_ref()
    }

    /// Take the lock on behalf of `client`.
    pub fn lock(
        &mut self,
        client: &str,
        key: Option<String>,
        timeout: Option<u64>,
    ) -> Result<(), LockError> {
        self.install(Lock::new(key, timeout).held_by(client))
    }

    /// Install a prepared lock record.
    pub fn install(&mut self, lock: Lock) -> Result<(), LockError> {
        if let Some(existing) = &self.current
            && !existing.is_expired()
        {
            return Err(LockError::Conflict);
        }
        self.current = Some(lock);
        Ok(())
    }

    /// Release the lock.
    pub fn unlock(&mut self, key: Option<&str>, force: bool) -> Result<(), LockError> {
        let Some(existing) = &self.current else {
            return Ok(());
        };
        if existing.is_expired() || existing.key.is_none() || existing.key_matches(key) || force {
            self.current = None;
            return Ok(());
        }
        Err(LockError::Forbidden)
    }

    /// Admit or reject a call from `client`.
    pub fn check(&self, client: &str) -> Result<(), LockError> {
        match &self.current {
            None => Ok(()),
            Some(lock) if lock.is_expired() || lock.admits(client) => Ok(()),
            Some(_) => Err(LockError::Locked),
        }
    }
}
