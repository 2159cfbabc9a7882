// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container engine for testing.
//!
//! Keeps an in-memory image store; builds and pushes are counted so tests can
//! assert on cache behaviour.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::ContainerEngine;
use crate::error::{Error, Result};

/// A build the mock engine performed.
#[derive(Debug, Clone)]
pub struct MockBuild {
    /// Image reference built.
    pub image: String,
    /// Rendered instruction file at build time.
    pub containerfile: String,
    /// Labels attached to the image.
    pub labels: BTreeMap<String, String>,
}

/// Mock engine for testing.
pub struct MockEngine {
    images: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
    builds: Arc<Mutex<Vec<MockBuild>>>,
    build_count: AtomicUsize,
    push_count: AtomicUsize,
    /// If true, every build fails
    pub fail_builds: bool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create a new mock engine with no images.
    pub fn new() -> Self {
        Self {
            images: Arc::new(Mutex::new(BTreeMap::new())),
            builds: Arc::new(Mutex::new(Vec::new())),
            build_count: AtomicUsize::new(0),
            push_count: AtomicUsize::new(0),
            fail_builds: false,
        }
    }

    /// Create a mock engine whose builds fail.
    pub fn failing() -> Self {
        Self {
            fail_builds: true,
            ..Self::new()
        }
    }

    /// Seed an image, as if it had been pushed by someone else.
    pub async fn insert_image(&self, image: &str, labels: BTreeMap<String, String>) {
        self.images.lock().await.insert(image.to_string(), labels);
    }

    /// Number of builds performed.
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }

    /// Number of pushes performed.
    pub fn push_count(&self) -> usize {
        self.push_count.load(Ordering::SeqCst)
    }

    /// Builds performed so far, oldest first.
    pub async fn builds(&self) -> Vec<MockBuild> {
        self.builds.lock().await.clone()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn engine_type(&self) -> &'static str {
        "mock"
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self.images.lock().await.keys().cloned().collect())
    }

    async fn build(
        &self,
        _context: &Path,
        containerfile: &Path,
        image: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_builds {
            return Err(Error::Build(format!("mock build of {image} failed")));
        }

        let containerfile = tokio::fs::read_to_string(containerfile)
            .await
            .unwrap_or_default();
        self.builds.lock().await.push(MockBuild {
            image: image.to_string(),
            containerfile,
            labels: labels.clone(),
        });
        self.images
            .lock()
            .await
            .insert(image.to_string(), labels.clone());
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        if self.images.lock().await.contains_key(image) {
            Ok(())
        } else {
            Err(Error::Push(format!("{image} does not exist")))
        }
    }

    async fn image_labels(&self, image: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.images.lock().await.get(image).cloned())
    }
}
