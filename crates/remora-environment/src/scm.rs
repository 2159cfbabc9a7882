// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source control capability.
//!
//! A [`SourceControl`] enumerates the files of the caller's repository and
//! fingerprints them. Two fingerprints matter:
//!
//! - `sha` covers every tracked file and changes on any edit
//! - `env_sha` covers only the dependency manifests of the detected
//!   [`ProjectKind`], so source-only edits leave it unchanged
//!
//! Both are SHA-256 over the sorted `(path, length, bytes)` of the files they
//! cover, so the same tree always yields the same value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use remora_protocol::SourceStamp;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::image::ProjectKind;

/// Read access to the caller's source tree.
pub trait SourceControl: Send + Sync {
    /// Repository name.
    fn name(&self) -> String;

    /// Repository root on the local filesystem.
    fn root(&self) -> &Path;

    /// Every tracked file, relative to the root, sorted.
    fn all_files(&self) -> Result<Vec<String>>;

    /// Contents of a tracked file.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Project kind detected from root-level marker files.
    fn project_kind(&self) -> Result<ProjectKind> {
        ProjectKind::detect(&self.all_files()?)
            .ok_or_else(|| Error::UnknownProjectKind(self.root().to_path_buf()))
    }

    /// Fingerprint of every tracked file.
    fn sha(&self) -> Result<String> {
        fingerprint(self, &self.all_files()?)
    }

    /// Fingerprint of the dependency manifests only.
    fn env_sha(&self) -> Result<String> {
        let files = self.all_files()?;
        let kind = ProjectKind::detect(&files)
            .ok_or_else(|| Error::UnknownProjectKind(self.root().to_path_buf()))?;
        fingerprint(self, &kind.manifests(&files))
    }

    /// Both fingerprints plus the repository name.
    fn stamp(&self) -> Result<SourceStamp> {
        Ok(SourceStamp {
            repo_sha: self.sha()?,
            env_sha: self.env_sha()?,
            repo_name: self.name(),
        })
    }
}

/// Hash `paths` (sorted) and their contents.
pub fn fingerprint<S: SourceControl + ?Sized>(source: &S, paths: &[String]) -> Result<String> {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for path in sorted {
        let bytes = source.read(path)?;
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A git working tree.
///
/// Tracked files are those `git ls-files --cached --others --exclude-standard`
/// reports, so untracked but not ignored files are included.
#[derive(Debug, Clone)]
pub struct GitSource {
    root: PathBuf,
}

impl GitSource {
    /// Open the repository containing `path`.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path.as_ref())
            .args(["rev-parse", "--show-toplevel"])
            .output()?;
        if !output.status.success() {
            return Err(Error::SourceControl(format!(
                "{} is not inside a git repository: {}",
                path.as_ref().display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            root: PathBuf::from(root),
        })
    }
}

impl SourceControl for GitSource {
    fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn all_files(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["ls-files", "--cached", "--others", "--exclude-standard", "-z"])
            .output()?;
        if !output.status.success() {
            return Err(Error::SourceControl(format!(
                "git ls-files failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut files: Vec<String> = output
            .stdout
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            // Deleted but still indexed files
            .filter(|rel| self.root.join(rel).is_file())
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.root.join(path))?)
    }
}

/// In-memory source tree.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    name: String,
    root: PathBuf,
    files: BTreeMap<String, Vec<u8>>,
}

impl StaticSource {
    /// Empty tree with the given repository name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            root: PathBuf::from("/").join(&name),
            name,
            files: BTreeMap::new(),
        }
    }

    /// Add or replace a file.
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Add or replace a file in place.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Use a real directory as the root (build contexts are written there).
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }
}

impl SourceControl for StaticSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn all_files(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust_tree() -> StaticSource {
        StaticSource::new("demo")
            .with_file("Cargo.toml", "[package]\nname = \"demo\"\n")
            .with_file("Cargo.lock", "version = 4\n")
            .with_file("src/main.rs", "fn main() {}\n")
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let tree = rust_tree();
        let a = fingerprint(&tree, &["src/main.rs".into(), "Cargo.toml".into()]).unwrap();
        let b = fingerprint(&tree, &["Cargo.toml".into(), "src/main.rs".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_path_is_part_of_fingerprint() {
        let a = StaticSource::new("x").with_file("a.txt", "same");
        let b = StaticSource::new("x").with_file("b.txt", "same");
        assert_ne!(a.sha().unwrap(), b.sha().unwrap());
    }

    #[test]
    fn test_source_edit_changes_sha_not_env_sha() {
        let before = rust_tree();
        let after = rust_tree().with_file("src/main.rs", "fn main() { println!(); }\n");
        assert_ne!(before.sha().unwrap(), after.sha().unwrap());
        assert_eq!(before.env_sha().unwrap(), after.env_sha().unwrap());
    }

    #[test]
    fn test_manifest_edit_changes_both() {
        let before = rust_tree();
        let after = rust_tree().with_file("Cargo.lock", "version = 4\n# bumped\n");
        assert_ne!(before.sha().unwrap(), after.sha().unwrap());
        assert_ne!(before.env_sha().unwrap(), after.env_sha().unwrap());
    }

    #[test]
    fn test_unknown_project_kind() {
        let tree = StaticSource::new("x").with_file("README.md", "hi");
        assert!(matches!(
            tree.env_sha().unwrap_err(),
            Error::UnknownProjectKind(_)
        ));
    }

    #[test]
    fn test_discover_outside_git_is_source_control_error() {
        let dir = tempfile::tempdir().unwrap();
        match GitSource::discover(dir.path()) {
            Err(Error::SourceControl(message)) => {
                assert!(message.contains("not inside a git repository"))
            }
            // No git binary on this machine
            Err(Error::Io(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(source) => panic!("discovered {}", source.root().display()),
        }
    }

    #[test]
    fn test_git_source_lists_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            Command::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .output()
                .unwrap()
        };
        if !git(&["init", "-q"]).status.success() {
            return;
        }
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        let source = GitSource::discover(dir.path()).unwrap();
        let files = source.all_files().unwrap();
        assert_eq!(files, vec![".gitignore", "requirements.txt"]);
        assert_eq!(source.project_kind().unwrap(), ProjectKind::Requirements);
    }
}
