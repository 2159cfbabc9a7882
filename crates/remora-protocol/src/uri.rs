// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `k8s://<namespace>/<pod>` process URIs.

use crate::ProtocolError;

const SCHEME: &str = "k8s://";

/// Location of a running resource process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct K8sUri {
    /// Namespace of the pod.
    pub namespace: String,
    /// Pod name.
    pub name: String,
}

impl K8sUri {
    /// Create a URI for a pod.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Whether the string uses the `k8s://` scheme.
    pub fn is_k8s(s: &str) -> bool {
        s.starts_with(SCHEME)
    }
}

impl std::fmt::Display for K8sUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.namespace, self.name)
    }
}

impl std::str::FromStr for K8sUri {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| ProtocolError::InvalidUri(s.to_string()))?;
        match rest.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(K8sUri::new(namespace, name))
            }
            _ => Err(ProtocolError::InvalidUri(s.to_string())),
        }
    }
}
