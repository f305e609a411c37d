//! Language-model backend interface and the command-based implementation.

use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Actor, AttemptOutcome, ModelResponse, ToolInvocation};
use crate::io::process::run_command_with_timeout;

/// Tool description advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// One logical request, independent of the model it is sent to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub actor: Actor,
    pub actor_id: String,
    pub prompt: String,
    /// Empty for planners, which never call tools.
    pub tools: Vec<ToolSpec>,
}

/// Classified failure of a single backend attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            BackendError::RateLimited(_) => AttemptOutcome::RateLimited,
            BackendError::Transient(_) => AttemptOutcome::Transient,
            BackendError::Fatal(_) => AttemptOutcome::Fatal,
        }
    }
}

/// Lowercase phrases that mark free-form backend output as a rate limit or
/// exhausted quota.
const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "capacity",
    "limit reached",
    "usage limit",
    "model limit",
    "429",
];

/// Whether unstructured error text reports a rate limit or quota.
pub fn is_rate_limit_text(text: &str) -> bool {
    let text = text.to_lowercase();
    RATE_LIMIT_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

/// A language-model service. One call is one attempt against one model id.
pub trait ModelBackend: Send + Sync {
    fn send(&self, request: &ModelRequest, model: &str) -> Result<ModelResponse, BackendError>;
}

impl<B: ModelBackend + ?Sized> ModelBackend for &B {
    fn send(&self, request: &ModelRequest, model: &str) -> Result<ModelResponse, BackendError> {
        (**self).send(request, model)
    }
}

/// Backend that spawns a configured command per attempt.
///
/// The command receives one JSON object on stdin:
/// `{"model", "actor", "actor_id", "prompt", "tools"}` and must print one JSON
/// object on stdout, one of:
///
/// - `{"type":"text","text":"..."}`
/// - `{"type":"tool_call","name":"...","arguments":{...}}`
/// - `{"type":"error","kind":"rate_limited"|"transient"|"fatal","message":"..."}`
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

#[derive(Serialize)]
struct CommandInput<'a> {
    model: &'a str,
    actor: Actor,
    actor_id: &'a str,
    prompt: &'a str,
    tools: &'a [ToolSpec],
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CommandReply {
    Text {
        text: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    Error {
        kind: ErrorKind,
        #[serde(default)]
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorKind {
    RateLimited,
    Transient,
    Fatal,
}

impl ModelBackend for CommandBackend {
    #[instrument(skip_all, fields(model = %model, actor_id = %request.actor_id))]
    fn send(&self, request: &ModelRequest, model: &str) -> Result<ModelResponse, BackendError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(BackendError::Fatal("backend command is empty".to_string()));
        };
        let input = serde_json::to_vec(&CommandInput {
            model,
            actor: request.actor,
            actor_id: &request.actor_id,
            prompt: &request.prompt,
            tools: &request.tools,
        })
        .map_err(|err| BackendError::Fatal(format!("serialize backend input: {err}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
                .map_err(|err| BackendError::Fatal(format!("{err:#}")))?;

        if output.timed_out {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                "model backend timed out"
            );
            return Err(BackendError::Transient(format!(
                "backend timed out after {}s",
                self.timeout.as_secs()
            )));
        }

        let stdout = output.stdout_lossy();
        if let Some(reply) = decode_reply(&stdout) {
            return reply.into_result();
        }
        let stderr = output.stderr_lossy();
        if is_rate_limit_text(&stderr) || is_rate_limit_text(&stdout) {
            debug!("unstructured backend output reports a rate limit");
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(BackendError::RateLimited(format!(
                "backend exited with {:?}: {detail}",
                output.status.code()
            )));
        }
        let err = unstructured_error(&stdout);
        if output.status.success() {
            debug!(err = %err, "unparseable backend output with success exit");
            return Err(err);
        }
        Err(BackendError::Fatal(format!(
            "backend exited with {:?}: {err}; stderr: {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}

impl CommandReply {
    fn into_result(self) -> Result<ModelResponse, BackendError> {
        match self {
            CommandReply::Text { text } => Ok(ModelResponse::Text { text }),
            CommandReply::ToolCall { name, arguments } => {
                Ok(ModelResponse::ToolCall(ToolInvocation { name, arguments }))
            }
            CommandReply::Error { kind, message } => Err(match kind {
                ErrorKind::RateLimited => BackendError::RateLimited(message),
                ErrorKind::Transient => BackendError::Transient(message),
                ErrorKind::Fatal => BackendError::Fatal(message),
            }),
        }
    }
}

/// The whole output as one object, else its last non-empty line.
fn decode_reply(stdout: &str) -> Option<CommandReply> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        let last = trimmed.lines().rev().find(|l| !l.trim().is_empty())?;
        serde_json::from_str(last).ok()
    })
}

fn unstructured_error(stdout: &str) -> BackendError {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return BackendError::Transient("backend produced no output".to_string());
    }
    let err = serde_json::from_str::<CommandReply>(trimmed)
        .err()
        .map_or_else(String::new, |err| err.to_string());
    BackendError::Transient(format!("unparseable backend output: {err}"))
}

/// Parse the backend's stdout into a response or a classified error.
///
/// Surrounding whitespace and leading log lines are tolerated: the last
/// non-empty line is taken when the whole output is not a single object.
pub fn parse_backend_reply(stdout: &str) -> Result<ModelResponse, BackendError> {
    match decode_reply(stdout) {
        Some(reply) => reply.into_result(),
        None => Err(unstructured_error(stdout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            actor: Actor::Worker,
            actor_id: "r1-root-1".to_string(),
            prompt: "hello".to_string(),
            tools: Vec::new(),
        }
    }

    fn sh_backend(script: &str, timeout: Duration) -> CommandBackend {
        CommandBackend::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
            64 * 1024,
        )
    }

    #[test]
    fn parses_each_reply_kind() {
        assert_eq!(
            parse_backend_reply(r#"{"type":"text","text":"hi"}"#),
            Ok(ModelResponse::Text {
                text: "hi".to_string()
            })
        );
        match parse_backend_reply("log line\n{\"type\":\"tool_call\",\"name\":\"read_file\"}\n") {
            Ok(ModelResponse::ToolCall(invocation)) => assert_eq!(invocation.name, "read_file"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse_backend_reply(r#"{"type":"error","kind":"rate_limited","message":"slow down"}"#),
            Err(BackendError::RateLimited("slow down".to_string()))
        );
        assert!(matches!(
            parse_backend_reply("not json"),
            Err(BackendError::Transient(_))
        ));
    }

    #[test]
    fn command_backend_receives_model_on_stdin() {
        let backend = sh_backend(
            r#"input=$(cat); case "$input" in *'"model":"m-2"'*) echo '{"type":"text","text":"ok"}';; *) exit 1;; esac"#,
            Duration::from_secs(10),
        );
        assert_eq!(
            backend.send(&request(), "m-2"),
            Ok(ModelResponse::Text {
                text: "ok".to_string()
            })
        );
    }

    #[test]
    fn garbage_with_failing_exit_is_fatal() {
        let backend = sh_backend("cat >/dev/null; echo boom >&2; exit 3", Duration::from_secs(10));
        assert!(matches!(
            backend.send(&request(), "m"),
            Err(BackendError::Fatal(_))
        ));
    }

    #[test]
    fn rate_limit_text_on_failing_exit_is_rate_limited() {
        for script in [
            "cat >/dev/null; echo 'HTTP 429 Too Many Requests' >&2; exit 1",
            "cat >/dev/null; echo 'error: monthly quota exceeded'; exit 2",
        ] {
            let backend = sh_backend(script, Duration::from_secs(10));
            assert!(
                matches!(backend.send(&request(), "m"), Err(BackendError::RateLimited(_))),
                "{script}"
            );
        }
    }

    #[test]
    fn structured_error_kind_wins_over_keywords() {
        let backend = sh_backend(
            r#"cat >/dev/null; echo '{"type":"error","kind":"fatal","message":"over capacity"}'; exit 1"#,
            Duration::from_secs(10),
        );
        assert_eq!(
            backend.send(&request(), "m"),
            Err(BackendError::Fatal("over capacity".to_string()))
        );
    }

    #[test]
    fn rate_limit_keywords_match_case_insensitively() {
        assert!(is_rate_limit_text("Rate Limit hit for model x"));
        assert!(is_rate_limit_text("Usage limit reached, try later"));
        assert!(!is_rate_limit_text("invalid api key"));
    }

    #[test]
    fn timeout_is_transient() {
        let backend = sh_backend("exec sleep 5", Duration::from_millis(200));
        assert!(matches!(
            backend.send(&request(), "m"),
            Err(BackendError::Transient(_))
        ));
    }

    #[test]
    fn missing_program_is_fatal() {
        let backend = CommandBackend::new(
            vec!["relay-definitely-missing-backend".to_string()],
            Duration::from_secs(1),
            1024,
        );
        assert!(matches!(
            backend.send(&request(), "m"),
            Err(BackendError::Fatal(_))
        ));
    }
}
