// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process bootstrap for a resource server.
//!
//! Construction sources, first match wins:
//!
//! 1. saved artifact `<artifact dir>/<short name>.json`
//! 2. mounted `<config dir>/config.json`
//! 3. `--params <json>` on the command line
//! 4. `Params::default()`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use remora_protocol::constants::{CONFIG_DIR, CONFIG_FILE_NAME, LOG_LEVEL_ENV, SERVER_PORT};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{ResourceError, Result};
use crate::logs::LogBuffer;
use crate::resource::Resource;
use crate::server::{ResourceServer, ServerContext, artifact_path};

/// Environment variable overriding where `config.json` is read from.
pub const CONFIG_DIR_ENV: &str = "REMORA_CONFIG_DIR";

/// Command line of a resource server binary.
#[derive(Debug, Clone, Parser)]
#[command(about = "Serve a remora resource")]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "REMORA_PORT", default_value_t = SERVER_PORT)]
    pub port: u16,

    /// Constructor parameters as a JSON object
    #[arg(long)]
    pub params: Option<String>,

    /// Directory holding `config.json`
    #[arg(long, env = CONFIG_DIR_ENV, default_value = CONFIG_DIR)]
    pub config_dir: PathBuf,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            port: SERVER_PORT,
            params: None,
            config_dir: PathBuf::from(CONFIG_DIR),
        }
    }
}

/// Where the initial instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Restored from a saved artifact.
    Artifact,
    /// Built from the mounted `config.json`.
    Config,
    /// Built from `--params`.
    Args,
    /// Built from default parameters.
    Default,
}

/// Construct the initial instance following the bootstrap priority.
pub fn from_env<R: Resource>(context: &ServerContext, args: &ServerArgs) -> Result<(R, Origin)> {
    let artifact = artifact_path::<R>(&context.artifact_dir);
    if let Some(bytes) = read_if_exists(&artifact)? {
        let resource = serde_json::from_slice(&bytes)?;
        return Ok((resource, Origin::Artifact));
    }

    let config = args.config_dir.join(CONFIG_FILE_NAME);
    if let Some(bytes) = read_if_exists(&config)? {
        let params: R::Params = serde_json::from_slice(&bytes)
            .map_err(|e| ResourceError::BadRequest(format!("{}: {}", config.display(), e)))?;
        return Ok((R::new(params), Origin::Config));
    }

    if let Some(raw) = &args.params {
        let params: R::Params = serde_json::from_str(raw)
            .map_err(|e| ResourceError::BadRequest(format!("--params: {e}")))?;
        return Ok((R::new(params), Origin::Args));
    }

    Ok((R::new(R::Params::default()), Origin::Default))
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Install the global subscriber, teeing formatted output into `logs`.
///
/// Filter comes from `LOG_LEVEL`, then `RUST_LOG`, then `info`.
pub fn init_tracing(logs: LogBuffer) {
    let filter = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    // A subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(logs)
        .try_init();
}

/// Parse arguments, construct `R` and serve until ctrl-c.
pub async fn run<R: Resource>() -> Result<()> {
    let args = ServerArgs::parse();
    let logs = LogBuffer::default();
    init_tracing(logs.clone());

    let context = ServerContext::from_env();
    let (resource, origin) = from_env::<R>(&context, &args)?;
    info!(
        resource = R::NAME,
        ?origin,
        process_uri = %context.process_uri,
        object_uri = %context.object_uri,
        "resource constructed"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    ResourceServer::new(resource, context)
        .with_logs(logs)
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Bar, BarParams};

    fn context(dir: &Path) -> ServerContext {
        ServerContext {
            artifact_dir: dir.join("artifacts"),
            ..Default::default()
        }
    }

    fn args(dir: &Path, params: Option<&str>) -> ServerArgs {
        ServerArgs {
            params: params.map(str::to_string),
            config_dir: dir.join("config"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_when_nothing_present() {
        let dir = tempfile::tempdir().unwrap();
        let (bar, origin) = from_env::<Bar>(&context(dir.path()), &args(dir.path(), None)).unwrap();
        assert_eq!(origin, Origin::Default);
        assert_eq!(bar, Bar::new(BarParams::default()));
    }

    #[test]
    fn test_args_beat_default() {
        let dir = tempfile::tempdir().unwrap();
        let (bar, origin) = from_env::<Bar>(
            &context(dir.path()),
            &args(dir.path(), Some(r#"{"a": "x", "b": 2}"#)),
        )
        .unwrap();
        assert_eq!(origin, Origin::Args);
        assert_eq!(bar.echo("hi"), "hi -- hello! a: x b: 2");
    }

    #[test]
    fn test_config_beats_args() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            dir.path().join("config").join(CONFIG_FILE_NAME),
            r#"{"a": "cfg", "b": 7}"#,
        )
        .unwrap();
        let (bar, origin) = from_env::<Bar>(
            &context(dir.path()),
            &args(dir.path(), Some(r#"{"a": "x", "b": 2}"#)),
        )
        .unwrap();
        assert_eq!(origin, Origin::Config);
        assert_eq!(bar.echo("hi"), "hi -- hello! a: cfg b: 7");
    }

    #[test]
    fn test_artifact_beats_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        std::fs::create_dir_all(&ctx.artifact_dir).unwrap();
        std::fs::write(artifact_path::<Bar>(&ctx.artifact_dir), r#"{"a": "saved", "b": 9}"#)
            .unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            dir.path().join("config").join(CONFIG_FILE_NAME),
            r#"{"a": "cfg", "b": 7}"#,
        )
        .unwrap();
        let (bar, origin) = from_env::<Bar>(&ctx, &args(dir.path(), None)).unwrap();
        assert_eq!(origin, Origin::Artifact);
        assert_eq!(bar.echo("hi"), "hi -- hello! a: saved b: 9");
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = from_env::<Bar>(&context(dir.path()), &args(dir.path(), Some("{nope")))
            .unwrap_err();
        assert!(matches!(err, ResourceError::BadRequest(_)));
    }
}
