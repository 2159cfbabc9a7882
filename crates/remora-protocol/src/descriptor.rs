// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource type metadata.
//!
//! All resource metadata rides on image labels and pod annotations; there is no
//! separate metadata store. [`ResourceLabels`] is the single place that maps a
//! [`ResourceDescriptor`] plus a [`SourceStamp`] onto those keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    BASES_LABEL, ENV_SHA_LABEL, NAME_LABEL, PARAMS_SCHEMA_LABEL, REPO_NAME_LABEL, REPO_ROOT,
    REPO_SHA_LABEL, SERVER_PATH_LABEL, VERSION_LABEL,
};

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Type name, e.g. `Bar`.
    pub name: String,
    /// Names of the types this resource builds on, most specific first.
    pub bases: Vec<String>,
    /// JSON schema of the constructor parameters.
    pub params_schema: Value,
    /// Server entrypoint relative to the repository root.
    pub server_path: String,
}

impl ResourceDescriptor {
    /// Create a descriptor with no bases and an empty parameter schema.
    pub fn new(name: impl Into<String>, server_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
            params_schema: Value::Object(Default::default()),
            server_path: server_path.into(),
        }
    }

    /// Set the base type names.
    pub fn with_bases(mut self, bases: Vec<String>) -> Self {
        self.bases = bases;
        self
    }

    /// Set the parameter schema.
    pub fn with_params_schema(mut self, schema: Value) -> Self {
        self.params_schema = schema;
        self
    }

    /// Lowercase name used for tags, pod names and artifact files.
    pub fn short_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Entrypoint path inside the image.
    pub fn container_server_path(&self) -> String {
        format!(
            "{}/{}",
            REPO_ROOT,
            self.server_path.trim_start_matches("./").trim_start_matches('/')
        )
    }
}

/// Source fingerprint a build or process was produced from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    /// Fingerprint of every tracked file.
    pub repo_sha: String,
    /// Fingerprint of the dependency manifests only.
    pub env_sha: String,
    /// Repository name.
    pub repo_name: String,
}

/// Labels attached to images and copied onto pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLabels(BTreeMap<String, String>);

impl ResourceLabels {
    /// Build the label set for a resource type at a source revision.
    pub fn new(descriptor: &ResourceDescriptor, stamp: &SourceStamp) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            BASES_LABEL.to_string(),
            serde_json::to_string(&descriptor.bases).unwrap_or_else(|_| "[]".to_string()),
        );
        labels.insert(NAME_LABEL.to_string(), descriptor.name.clone());
        labels.insert(VERSION_LABEL.to_string(), stamp.repo_sha.clone());
        labels.insert(
            PARAMS_SCHEMA_LABEL.to_string(),
            descriptor.params_schema.to_string(),
        );
        labels.insert(ENV_SHA_LABEL.to_string(), stamp.env_sha.clone());
        labels.insert(REPO_NAME_LABEL.to_string(), stamp.repo_name.clone());
        labels.insert(REPO_SHA_LABEL.to_string(), stamp.repo_sha.clone());
        labels.insert(
            SERVER_PATH_LABEL.to_string(),
            descriptor.container_server_path(),
        );
        Self(labels)
    }

    /// Wrap an existing map, e.g. labels read back from an image.
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// Look up a label.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Add or replace a label.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Entrypoint path recorded at build time.
    pub fn server_path(&self) -> Option<&str> {
        self.get(SERVER_PATH_LABEL)
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    /// Whether no labels are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bar() -> ResourceDescriptor {
        ResourceDescriptor::new("Bar", "src/bin/bar-server.rs")
            .with_bases(vec!["Bar".into(), "Resource".into()])
            .with_params_schema(json!({"type": "object"}))
    }

    #[test]
    fn test_labels_cover_all_keys() {
        let stamp = SourceStamp {
            repo_sha: "abc".into(),
            env_sha: "def".into(),
            repo_name: "demo".into(),
        };
        let labels = ResourceLabels::new(&bar(), &stamp);
        assert_eq!(labels.get(NAME_LABEL), Some("Bar"));
        assert_eq!(labels.get(VERSION_LABEL), Some("abc"));
        assert_eq!(labels.get(ENV_SHA_LABEL), Some("def"));
        assert_eq!(labels.get(BASES_LABEL), Some(r#"["Bar","Resource"]"#));
        assert_eq!(labels.get(PARAMS_SCHEMA_LABEL), Some(r#"{"type":"object"}"#));
        assert_eq!(labels.server_path(), Some("/app/src/bin/bar-server.rs"));
    }

    #[test]
    fn test_short_name_is_lowercase() {
        assert_eq!(bar().short_name(), "bar");
    }
}
