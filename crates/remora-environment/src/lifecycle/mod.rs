// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Building blocks of the provisioning state machine.

pub mod file_sync;
pub mod pod_locator;
pub mod readiness;
pub mod snapshot;

pub use file_sync::{FileSyncer, tar_archive};
pub use pod_locator::PodLocator;
pub use readiness::ReadinessWaiter;
pub use snapshot::{SNAPSHOT_CONTAINERFILE, SnapshotRequest, SnapshotStore};
