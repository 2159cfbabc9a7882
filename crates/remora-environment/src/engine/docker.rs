// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine backed by the `docker` command line.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::ContainerEngine;
use crate::error::{Error, Result};

/// Drives a docker-compatible CLI (`docker`, `podman`, `nerdctl`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    /// Use the CLI at `bin`.
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(bin = %self.bin, ?args, "running container engine");
        Ok(Command::new(&self.bin).args(args).output().await?)
    }

    /// Run with stdout/stderr forwarded line by line to the log.
    ///
    /// Returns the tail of stderr on failure.
    async fn run_streaming(&self, args: Vec<String>) -> std::result::Result<(), String> {
        debug!(bin = %self.bin, ?args, "running container engine");
        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.bin, e))?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward(out, false)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(forward(err, true)));

        let status = child
            .wait()
            .await
            .map_err(|e| format!("failed to wait for {}: {}", self.bin, e))?;

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}: {}", self.bin, status, tail.join("\n")))
        }
    }
}

/// Log each line; keep the last few of stderr for error messages.
async fn forward<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "remora::build", "{}", line);
        if is_stderr {
            if tail.len() == 20 {
                tail.remove(0);
            }
            tail.push(line);
        }
    }
    tail
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn engine_type(&self) -> &'static str {
        "docker"
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let output = self
            .output(&["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        if !output.status.success() {
            return Err(Error::Build(format!(
                "listing images failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn build(
        &self,
        context: &Path,
        containerfile: &Path,
        image: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            containerfile.display().to_string(),
            "-t".to_string(),
            image.to_string(),
        ];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(context.display().to_string());

        self.run_streaming(args).await.map_err(Error::Build)
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.run_streaming(vec!["push".to_string(), image.to_string()])
            .await
            .map_err(Error::Push)
    }

    async fn image_labels(&self, image: &str) -> Result<Option<BTreeMap<String, String>>> {
        let inspect = ["image", "inspect", "--format", "{{json .Config.Labels}}", image];
        let mut output = self.output(&inspect).await?;
        if !output.status.success() {
            let pulled = self.output(&["pull", image]).await?;
            if !pulled.status.success() {
                debug!(image, "image not found locally or in registry");
                return Ok(None);
            }
            output = self.output(&inspect).await?;
            if !output.status.success() {
                return Ok(None);
            }
        }

        let labels: Option<BTreeMap<String, String>> = serde_json::from_slice(&output.stdout)?;
        Ok(Some(labels.unwrap_or_default()))
    }
}
