// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project kinds and their build recipes.
//!
//! The kind is chosen from marker files at the repository root:
//!
//! | Marker | Kind | Base image |
//! |--------|------|------------|
//! | `Cargo.lock` | [`ProjectKind::LockFile`] | `rust:1-slim` |
//! | `requirements.txt` | [`ProjectKind::Requirements`] | `python:3.11-slim` |
//! | `environment.yml` | [`ProjectKind::Environment`] | `continuumio/miniconda3` |
//!
//! Every recipe installs dependencies from the manifests before any source is
//! copied. The *base* recipe stops there and supervises the server over synced
//! sources; the *full* recipe copies every tracked file.

use std::collections::BTreeMap;
use std::path::Path;

use remora_protocol::RemoteSyncStrategy;
use remora_protocol::constants::{REPO_ROOT, REPO_SHA_ENV, SERVER_PORT, SYNC_MARKER};

use super::containerfile::ContainerFile;
use crate::error::Result;
use crate::scm::SourceControl;

/// Extra requirements installed when dev dependencies are requested.
const DEV_REQUIREMENTS: &str = "requirements-dev.txt";

/// Dependency management style of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectKind {
    /// Cargo workspace pinned by `Cargo.lock`.
    LockFile,
    /// pip `requirements.txt`.
    Requirements,
    /// conda `environment.yml`.
    Environment,
}

impl ProjectKind {
    /// Detect from root-level marker files; `Cargo.lock` wins over the others.
    pub fn detect(files: &[String]) -> Option<Self> {
        let has = |name: &str| files.iter().any(|f| f == name);
        if has("Cargo.lock") {
            Some(ProjectKind::LockFile)
        } else if has("requirements.txt") {
            Some(ProjectKind::Requirements)
        } else if has("environment.yml") {
            Some(ProjectKind::Environment)
        } else {
            None
        }
    }

    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectKind::LockFile => "lockfile",
            ProjectKind::Requirements => "requirements",
            ProjectKind::Environment => "environment",
        }
    }

    /// Dependency manifests among `files`; these alone determine the env sha.
    pub fn manifests(&self, files: &[String]) -> Vec<String> {
        files
            .iter()
            .filter(|f| {
                let name = file_name(f);
                match self {
                    ProjectKind::LockFile => name == "Cargo.toml" || name == "Cargo.lock",
                    ProjectKind::Requirements => {
                        f.as_str() == "requirements.txt" || f.as_str() == DEV_REQUIREMENTS
                    }
                    ProjectKind::Environment => f.as_str() == "environment.yml",
                }
            })
            .cloned()
            .collect()
    }

    /// Image every recipe of this kind starts from.
    pub fn base_image(&self) -> &'static str {
        match self {
            ProjectKind::LockFile => "rust:1-slim",
            ProjectKind::Requirements => "python:3.11-slim",
            ProjectKind::Environment => "continuumio/miniconda3:latest",
        }
    }

    /// Dependencies only.
    pub fn base_recipe(
        &self,
        source: &dyn SourceControl,
        dev_dependencies: bool,
    ) -> Result<ContainerFile> {
        let files = source.all_files()?;
        let manifests = self.manifests(&files);
        let file = ContainerFile::from_image(self.base_image()).workdir(REPO_ROOT);

        let file = match self {
            ProjectKind::LockFile => {
                // Keep each manifest at its relative path so the workspace resolves
                let file = manifests.iter().fold(file, |file, manifest| {
                    file.copy([manifest.clone()], format!("{REPO_ROOT}/{manifest}"))
                });
                file.run("cargo fetch --locked")
            }
            ProjectKind::Requirements => {
                let mut file = file
                    .copy(["requirements.txt"], format!("{REPO_ROOT}/"))
                    .run("python -m pip install -r requirements.txt");
                if dev_dependencies && files.iter().any(|f| f == DEV_REQUIREMENTS) {
                    file = file
                        .copy([DEV_REQUIREMENTS], format!("{REPO_ROOT}/"))
                        .run(format!("python -m pip install -r {DEV_REQUIREMENTS}"));
                }
                file.env("PYTHONUNBUFFERED", "1")
            }
            ProjectKind::Environment => {
                let env = conda_env_name(source)?;
                file.copy(["environment.yml"], format!("{REPO_ROOT}/"))
                    .run(format!(
                        "conda env update -n {env} -f environment.yml && conda clean -afy"
                    ))
                    .env("PYTHONUNBUFFERED", "1")
            }
        };
        Ok(file)
    }

    /// Dependencies plus every tracked file under the repository root.
    pub fn full_recipe(
        &self,
        source: &dyn SourceControl,
        dev_dependencies: bool,
    ) -> Result<ContainerFile> {
        let file = self.base_recipe(source, dev_dependencies)?;
        Ok(add_repo_files(file, &source.all_files()?))
    }

    /// Command starting the server at `server_path` (absolute, inside the image).
    pub fn start_command(
        &self,
        source: &dyn SourceControl,
        server_path: &str,
        dev_dependencies: bool,
    ) -> Result<Vec<String>> {
        let command = match self {
            ProjectKind::LockFile => {
                let bin = Path::new(server_path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut command = vec![
                    "cargo".to_string(),
                    "run".to_string(),
                    "--locked".to_string(),
                    "--manifest-path".to_string(),
                    format!("{REPO_ROOT}/Cargo.toml"),
                ];
                if !dev_dependencies {
                    command.push("--release".to_string());
                }
                command.push("--bin".to_string());
                command.push(bin);
                command
            }
            ProjectKind::Requirements => vec!["python".to_string(), server_path.to_string()],
            ProjectKind::Environment => vec![
                "conda".to_string(),
                "run".to_string(),
                "--no-capture-output".to_string(),
                "-n".to_string(),
                conda_env_name(source)?,
                "python".to_string(),
                server_path.to_string(),
            ],
        };
        Ok(command)
    }
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete build plan for a resource server image.
///
/// `Image` uses the full recipe. `Container` uses the base recipe and a
/// supervisor command that starts the server after the first sync and
/// restarts it after every later one.
pub fn server_recipe(
    kind: ProjectKind,
    strategy: RemoteSyncStrategy,
    source: &dyn SourceControl,
    server_path: &str,
    dev_dependencies: bool,
) -> Result<ContainerFile> {
    let command = kind.start_command(source, server_path, dev_dependencies)?;
    let file = match strategy {
        RemoteSyncStrategy::Image => kind.full_recipe(source, dev_dependencies)?.cmd(command),
        RemoteSyncStrategy::Container => kind
            .base_recipe(source, dev_dependencies)?
            .cmd(["sh".to_string(), "-c".to_string(), supervise(&command)]),
    };
    Ok(file.expose(SERVER_PORT))
}

/// Wait for the first sync, then run `command` and restart it whenever the
/// sync marker changes. The synced revision is exported as `REPO_SHA`, so the
/// server reports the revision it runs. A server exiting on its own is
/// restarted after a second.
fn supervise(command: &[String]) -> String {
    let marker = format!("{REPO_ROOT}/{SYNC_MARKER}");
    let command = command.join(" ");
    format!(
        "until [ -f {marker} ]; do sleep 1; done; \
         while true; do \
         rev=$(cat {marker}); \
         {REPO_SHA_ENV}=$rev {command} & pid=$!; \
         while kill -0 $pid 2>/dev/null && [ \"$(cat {marker})\" = \"$rev\" ]; do sleep 1; done; \
         kill $pid 2>/dev/null; wait $pid; \
         [ \"$(cat {marker})\" = \"$rev\" ] && sleep 1; \
         done"
    )
}

/// COPY tracked files grouped by directory, preserving the tree under the repo root.
pub fn add_repo_files(file: ContainerFile, files: &[String]) -> ContainerFile {
    let mut by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in files {
        let dir = match path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };
        by_dir.entry(dir).or_default().push(path.clone());
    }

    by_dir.into_iter().fold(file, |file, (dir, sources)| {
        let destination = if dir.is_empty() {
            format!("{REPO_ROOT}/")
        } else {
            format!("{REPO_ROOT}/{dir}/")
        };
        file.copy(sources, destination)
    })
}

/// `name:` of `environment.yml`, `base` when absent.
fn conda_env_name(source: &dyn SourceControl) -> Result<String> {
    let bytes = source.read("environment.yml")?;
    let text = String::from_utf8_lossy(&bytes);
    let name = text
        .lines()
        .find_map(|line| line.strip_prefix("name:"))
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty());
    Ok(name.unwrap_or_else(|| "base".to_string()))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
