//! Worker tools: `run_cmd`, `read_file`, `edit_file`.
//!
//! Every tool acts on exactly one [`RepoCopy`]. Paths are repo-relative;
//! absolute paths and `..` components are rejected before touching disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::transcript::truncate_back;
use crate::core::types::{ToolErrorKind, ToolInvocation, ToolObservation};
use crate::io::config::{MAX_TOOL_TIMEOUT_SECS, ToolsConfig};
use crate::io::model::ToolSpec;
use crate::io::process::run_command_with_timeout;
use crate::io::repo_copy::RepoCopy;

pub const RUN_CMD: &str = "run_cmd";
pub const READ_FILE: &str = "read_file";
pub const EDIT_FILE: &str = "edit_file";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("io error: {0}")]
    Io(String),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::Conflict(_) => ToolErrorKind::Conflict,
            ToolError::Timeout(_) => ToolErrorKind::Timeout,
            ToolError::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            ToolError::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolError::Io(_) => ToolErrorKind::Io,
        }
    }

    pub fn into_observation(self) -> ToolObservation {
        ToolObservation::Error {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    RunCmd {
        command: String,
        timeout_secs: Option<u64>,
    },
    ReadFile {
        path: String,
    },
    Overwrite {
        path: String,
        content: String,
    },
    Replace {
        path: String,
        old: String,
        new: String,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RunCmdArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileArgs {
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EditFileArgs {
    path: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    old: Option<String>,
    #[serde(default)]
    new: Option<String>,
}

impl ToolRequest {
    pub fn parse(invocation: &ToolInvocation) -> Result<Self, ToolError> {
        match invocation.name.as_str() {
            RUN_CMD => {
                let args: RunCmdArgs = decode_args(&invocation.arguments)?;
                if args.command.trim().is_empty() {
                    return Err(ToolError::InvalidArguments(
                        "command must be non-empty".to_string(),
                    ));
                }
                if args.timeout_secs == Some(0) {
                    return Err(ToolError::InvalidArguments(
                        "timeout_secs must be at least 1".to_string(),
                    ));
                }
                Ok(ToolRequest::RunCmd {
                    command: args.command,
                    timeout_secs: args.timeout_secs,
                })
            }
            READ_FILE => {
                let args: ReadFileArgs = decode_args(&invocation.arguments)?;
                Ok(ToolRequest::ReadFile { path: args.path })
            }
            EDIT_FILE => {
                let args: EditFileArgs = decode_args(&invocation.arguments)?;
                match (args.content, args.old, args.new) {
                    (Some(content), None, None) => Ok(ToolRequest::Overwrite {
                        path: args.path,
                        content,
                    }),
                    (None, Some(old), Some(new)) if !old.is_empty() => Ok(ToolRequest::Replace {
                        path: args.path,
                        old,
                        new,
                    }),
                    (None, Some(_), Some(_)) => Err(ToolError::InvalidArguments(
                        "old must be non-empty".to_string(),
                    )),
                    _ => Err(ToolError::InvalidArguments(
                        "edit_file takes either `content` or both `old` and `new`".to_string(),
                    )),
                }
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn decode_args<T: for<'de> Deserialize<'de>>(arguments: &Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|err| ToolError::InvalidArguments(err.to_string()))
}

/// Resolve a repo-relative path inside `root`.
pub fn resolve_path(root: &Path, raw: &str) -> Result<PathBuf, ToolError> {
    if raw.trim().is_empty() {
        return Err(ToolError::InvalidArguments("path must be non-empty".to_string()));
    }
    let rel = Path::new(raw);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ToolError::InvalidArguments(format!(
                    "path '{raw}' escapes the repository"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::InvalidArguments(format!(
                    "path '{raw}' must be relative"
                )));
            }
        }
    }
    Ok(root.join(rel))
}

/// Executes tool calls against a repository copy.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, copy: &RepoCopy, invocation: &ToolInvocation) -> ToolObservation;
}

/// Tool executor acting on the local filesystem and shell.
#[derive(Debug, Clone)]
pub struct LocalToolExecutor {
    default_timeout: Duration,
    output_limit_bytes: usize,
}

impl LocalToolExecutor {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn run(&self, copy: &RepoCopy, request: ToolRequest) -> Result<String, ToolError> {
        match request {
            ToolRequest::RunCmd {
                command,
                timeout_secs,
            } => self.run_cmd(copy.root(), &command, timeout_secs),
            ToolRequest::ReadFile { path } => self.read_file(copy.root(), &path),
            ToolRequest::Overwrite { path, content } => {
                let target = resolve_path(copy.root(), &path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|err| ToolError::Io(err.to_string()))?;
                }
                fs::write(&target, &content).map_err(|err| ToolError::Io(err.to_string()))?;
                Ok(format!("wrote {} bytes to {path}", content.len()))
            }
            ToolRequest::Replace { path, old, new } => {
                let target = resolve_path(copy.root(), &path)?;
                let current = read_text(&target, &path)?;
                let Some(at) = current.find(&old) else {
                    return Err(ToolError::Conflict(format!(
                        "`old` text not found verbatim in {path}"
                    )));
                };
                let mut updated = String::with_capacity(current.len() + new.len());
                updated.push_str(&current[..at]);
                updated.push_str(&new);
                updated.push_str(&current[at + old.len()..]);
                fs::write(&target, updated).map_err(|err| ToolError::Io(err.to_string()))?;
                Ok(format!("replaced 1 occurrence in {path}"))
            }
        }
    }

    fn run_cmd(
        &self,
        root: &Path,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<String, ToolError> {
        let timeout = timeout_secs
            .map_or(self.default_timeout, Duration::from_secs)
            .min(Duration::from_secs(MAX_TOOL_TIMEOUT_SECS));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(root);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|err| ToolError::Io(format!("{err:#}")))?;
        if output.timed_out {
            return Err(ToolError::Timeout(timeout.as_secs()));
        }
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Ok(format!(
            "exit code: {code}\nstdout:\n{}{}\nstderr:\n{}{}",
            output.stdout_lossy(),
            output.stdout_truncated_notice("run_cmd"),
            output.stderr_lossy(),
            output.stderr_truncated_notice("run_cmd"),
        ))
    }

    fn read_file(&self, root: &Path, path: &str) -> Result<String, ToolError> {
        let target = resolve_path(root, path)?;
        let contents = read_text(&target, path)?;
        if contents.len() <= self.output_limit_bytes {
            return Ok(contents);
        }
        let kept = truncate_back(&contents, self.output_limit_bytes);
        Ok(format!(
            "{kept}\n[read_file truncated {} bytes]\n",
            contents.len() - kept.len()
        ))
    }
}

fn read_text(target: &Path, display: &str) -> Result<String, ToolError> {
    match fs::read_to_string(target) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ToolError::NotFound(display.to_string()))
        }
        Err(err) => Err(ToolError::Io(format!("{display}: {err}"))),
    }
}

impl ToolExecutor for LocalToolExecutor {
    #[instrument(skip_all, fields(copy = %copy.id(), tool = %invocation.name))]
    fn execute(&self, copy: &RepoCopy, invocation: &ToolInvocation) -> ToolObservation {
        let result = ToolRequest::parse(invocation).and_then(|request| self.run(copy, request));
        match result {
            Ok(output) => ToolObservation::Ok { output },
            Err(err) => {
                debug!(err = %err, "tool call failed");
                err.into_observation()
            }
        }
    }
}

/// Tool descriptions advertised to workers.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: RUN_CMD.to_string(),
            description: format!(
                "Run a shell command in the repository root. Timeout defaults to the configured value and is capped at {MAX_TOOL_TIMEOUT_SECS}s."
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_secs": {"type": "integer", "minimum": 1, "maximum": MAX_TOOL_TIMEOUT_SECS}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: READ_FILE.to_string(),
            description: "Read a UTF-8 file by repo-relative path.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: EDIT_FILE.to_string(),
            description: "Overwrite a file with `content`, or replace the first verbatim occurrence of `old` with `new`.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "old": {"type": "string"},
                    "new": {"type": "string"}
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        },
    ]
}
