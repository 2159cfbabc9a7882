// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image identity, build plans and the image build cache.

pub mod build;
pub mod containerfile;
pub mod identity;
pub mod project;
pub mod registry;

pub use build::{BuildSpec, ImageBuildCache};
pub use containerfile::{CONTAINERFILE_NAME, ContainerFile, Instruction};
pub use identity::{DEFAULT_REGISTRY, ImageIdentity, build_identity, compute_tag};
pub use project::{ProjectKind, add_repo_files, server_recipe};
pub use registry::RegistryClient;
