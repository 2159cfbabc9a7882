// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Copies local source files into a running server container.

use std::path::Path;
use std::sync::Arc;

use remora_protocol::constants::{SERVER_CONTAINER, SYNC_MARKER};
use tar::Header;
use tracing::info;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::scm::SourceControl;

/// Pack `(path, contents)` pairs into an uncompressed tar archive.
///
/// Entries are regular files with mode 0644 and a zero mtime, so equal
/// inputs produce equal archives.
pub fn tar_archive<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(contents.len() as u64);
        builder.append_data(&mut header, Path::new(path), contents)?;
    }
    Ok(builder.into_inner()?)
}

/// Pushes tracked files into the server container of a pod.
///
/// Used by the container strategy only. The archive ends with the
/// [`SYNC_MARKER`] file carrying the synced revision; the entrypoint restarts
/// the server when it changes, so the caller waits for the new revision to
/// serve afterwards. A failed copy is not retried.
#[derive(Clone)]
pub struct FileSyncer {
    cluster: Arc<dyn Cluster>,
}

impl FileSyncer {
    /// Syncer copying through `cluster`.
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Copy `files` (relative to the source root) under `base_path` in the
    /// pod, then mark the tree as `revision`.
    pub async fn sync(
        &self,
        namespace: &str,
        pod: &str,
        files: &[String],
        source: &dyn SourceControl,
        base_path: &str,
        revision: &str,
    ) -> Result<()> {
        let contents = files
            .iter()
            .map(|path| Ok((path.as_str(), source.read(path)?)))
            .collect::<Result<Vec<_>>>()?;
        let marker = format!("{revision}\n");
        let entries = contents
            .iter()
            .map(|(p, c)| (*p, c.as_slice()))
            .chain([(SYNC_MARKER, marker.as_bytes())]);
        let archive = tar_archive(entries).map_err(|e| Error::Sync(e.to_string()))?;

        info!(
            pod,
            revision,
            files = files.len(),
            bytes = archive.len(),
            dest = base_path,
            "syncing files into pod"
        );
        self.cluster
            .copy_archive(namespace, pod, SERVER_CONTAINER, base_path, archive)
            .await
            .map_err(|e| match e {
                Error::Sync(_) => e,
                other => Error::Sync(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::scm::StaticSource;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::io::Read;

    fn entries(archive: &[u8]) -> Vec<(String, String)> {
        let mut reader = tar::Archive::new(archive);
        reader
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().display().to_string();
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                (path, body)
            })
            .collect()
    }

    #[test]
    fn test_archive_is_deterministic() {
        let files = [("a.txt", b"one".as_slice()), ("src/b.rs", b"two".as_slice())];
        let first = tar_archive(files).unwrap();
        assert_eq!(first, tar_archive(files).unwrap());
        assert_eq!(
            entries(&first),
            vec![
                ("a.txt".to_string(), "one".to_string()),
                ("src/b.rs".to_string(), "two".to_string())
            ]
        );
    }

    async fn cluster_with_pod(fail_copy: bool) -> Arc<MockCluster> {
        let mut cluster = MockCluster::new();
        cluster.fail_copy = fail_copy;
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("p".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        cluster.create_pod("ns", &pod).await.unwrap();
        Arc::new(cluster)
    }

    #[tokio::test]
    async fn test_sync_copies_into_base_path() {
        let cluster = cluster_with_pod(false).await;
        let source = StaticSource::new("demo").with_file("src/main.rs", "fn main() {}");
        FileSyncer::new(cluster.clone())
            .sync("ns", "p", &["src/main.rs".to_string()], &source, "/app", "abc")
            .await
            .unwrap();

        let archives = cluster.archives().await;
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].dest, "/app");
        let files = entries(&archives[0].archive);
        assert_eq!(files[0].1, "fn main() {}");
        // The marker comes last so the tree is complete when it changes
        assert_eq!(
            files.last().unwrap(),
            &(SYNC_MARKER.to_string(), "abc\n".to_string())
        );
    }

    #[tokio::test]
    async fn test_copy_failure_is_sync_error() {
        let cluster = cluster_with_pod(true).await;
        let source = StaticSource::new("demo").with_file("a", "b");
        let err = FileSyncer::new(cluster)
            .sync("ns", "p", &["a".to_string()], &source, "/app", "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sync(_)));
    }
}
