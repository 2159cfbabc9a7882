// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build instruction files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File name the build plan is written to in the build context.
pub const CONTAINERFILE_NAME: &str = "Containerfile.remora";

/// One build instruction.
#[allow(missing_docs)] // Fields are self-documenting from variant docs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// FROM image [AS name]
    From {
        image: String,
        stage_name: Option<String>,
    },
    /// RUN command
    Run { command: String },
    /// ENV key=value...
    Env { vars: BTreeMap<String, String> },
    /// WORKDIR /path
    Workdir { path: String },
    /// COPY ["src", ..., "dest"]
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    /// ADD ["src", ..., "dest"]
    Add {
        sources: Vec<String>,
        destination: String,
    },
    /// CMD ["exec", "form"]
    Cmd { args: Vec<String> },
    /// ENTRYPOINT ["exec", "form"]
    Entrypoint { args: Vec<String> },
    /// SHELL ["sh", "-c"]
    Shell { args: Vec<String> },
    /// EXPOSE port
    Expose { port: u16 },
    /// LABEL key=value...
    Label { labels: BTreeMap<String, String> },
    /// USER user[:group]
    User { user: String },
    /// VOLUME ["/data"]
    Volume { paths: Vec<String> },
    /// ARG name[=default]
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image, stage_name } => match stage_name {
                Some(name) => write!(f, "FROM {image} AS {name}"),
                None => write!(f, "FROM {image}"),
            },
            Instruction::Run { command } => write!(f, "RUN {command}"),
            Instruction::Env { vars } => write!(f, "ENV {}", pairs(vars)),
            Instruction::Workdir { path } => write!(f, "WORKDIR {path}"),
            Instruction::Copy {
                sources,
                destination,
            } => write!(f, "COPY {}", json_list(sources, Some(destination))),
            Instruction::Add {
                sources,
                destination,
            } => write!(f, "ADD {}", json_list(sources, Some(destination))),
            Instruction::Cmd { args } => write!(f, "CMD {}", json_list(args, None)),
            Instruction::Entrypoint { args } => {
                write!(f, "ENTRYPOINT {}", json_list(args, None))
            }
            Instruction::Shell { args } => write!(f, "SHELL {}", json_list(args, None)),
            Instruction::Expose { port } => write!(f, "EXPOSE {port}"),
            Instruction::Label { labels } => write!(f, "LABEL {}", pairs(labels)),
            Instruction::User { user } => write!(f, "USER {user}"),
            Instruction::Volume { paths } => write!(f, "VOLUME {}", json_list(paths, None)),
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, "ARG {name}={default}"),
                None => write!(f, "ARG {name}"),
            },
        }
    }
}

fn json_list(items: &[String], last: Option<&String>) -> String {
    let all: Vec<&String> = items.iter().chain(last).collect();
    serde_json::to_string(&all).unwrap_or_else(|_| "[]".to_string())
}

fn pairs(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

/// Ordered list of build instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFile {
    instructions: Vec<Instruction>,
}

impl ContainerFile {
    /// Start from a base image.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            instructions: vec![Instruction::From {
                image: image.into(),
                stage_name: None,
            }],
        }
    }

    /// Append any instruction.
    pub fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// RUN a shell command.
    pub fn run(self, command: impl Into<String>) -> Self {
        self.push(Instruction::Run {
            command: command.into(),
        })
    }

    /// Set one environment variable.
    pub fn env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(key.into(), value.into());
        self.push(Instruction::Env { vars })
    }

    /// Change the working directory.
    pub fn workdir(self, path: impl Into<String>) -> Self {
        self.push(Instruction::Workdir { path: path.into() })
    }

    /// COPY several sources into `destination`; a no-op for an empty list.
    pub fn copy<I, S>(self, sources: I, destination: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        if sources.is_empty() {
            return self;
        }
        self.push(Instruction::Copy {
            sources,
            destination: destination.into(),
        })
    }

    /// Declare a listening port.
    pub fn expose(self, port: u16) -> Self {
        self.push(Instruction::Expose { port })
    }

    /// Default command in exec form.
    pub fn cmd<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Instruction::Cmd {
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Instructions in order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Render as text, one instruction per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }

    /// Write to [`CONTAINERFILE_NAME`] in `dir` and return the path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONTAINERFILE_NAME);
        std::fs::write(&path, self.render())?;
        Ok(path)
    }
}

impl fmt::Display for ContainerFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_exec_and_json_forms() {
        let file = ContainerFile::from_image("python:3.11-slim")
            .workdir("/app")
            .copy(["requirements.txt"], "/app/")
            .run("pip install -r requirements.txt")
            .env("PYTHONUNBUFFERED", "1")
            .expose(8080)
            .cmd(["python", "/app/server.py"]);

        assert_eq!(
            file.render(),
            "FROM python:3.11-slim\n\
             WORKDIR /app\n\
             COPY [\"requirements.txt\",\"/app/\"]\n\
             RUN pip install -r requirements.txt\n\
             ENV PYTHONUNBUFFERED=\"1\"\n\
             EXPOSE 8080\n\
             CMD [\"python\",\"/app/server.py\"]\n"
        );
    }

    #[test]
    fn test_empty_copy_is_skipped() {
        let file = ContainerFile::from_image("scratch").copy(Vec::<String>::new(), "/app/");
        assert_eq!(file.instructions().len(), 1);
    }

    #[test]
    fn test_remaining_instructions_render() {
        let mut labels = BTreeMap::new();
        labels.insert("name".to_string(), "Bar".to_string());
        let file = ContainerFile::from_image("rust:1")
            .push(Instruction::Arg {
                name: "PROFILE".into(),
                default: Some("release".into()),
            })
            .push(Instruction::Label { labels })
            .push(Instruction::User { user: "root".into() })
            .push(Instruction::Volume {
                paths: vec!["/artifacts".into()],
            })
            .push(Instruction::Shell {
                args: vec!["/bin/sh".into(), "-c".into()],
            });
        let text = file.to_string();
        assert!(text.contains("ARG PROFILE=release\n"));
        assert!(text.contains("LABEL name=\"Bar\"\n"));
        assert!(text.contains("VOLUME [\"/artifacts\"]\n"));
        assert!(text.contains("SHELL [\"/bin/sh\",\"-c\"]\n"));
    }

    #[test]
    fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = ContainerFile::from_image("scratch").write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(CONTAINERFILE_NAME));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "FROM scratch\n");
    }
}
