//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the planner tree, the worker
//! pool, the model gateway and the session log. They serialize into the
//! session log and `result.json`, so field names must remain stable.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of the scope every session starts with.
pub const ROOT_SCOPE: &str = "root";

/// Stable identifier of a scope (the root, or a delegated sub-scope slug).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn root() -> Self {
        Self(ROOT_SCOPE.to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_SCOPE
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A portion of the goal owned by exactly one planner. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    /// Name as requested by the delegating planner (before normalization).
    pub name: String,
    pub description: String,
    pub boundary: Option<String>,
    /// `None` only for the root scope.
    pub parent: Option<ScopeId>,
    /// Round in which the scope was delegated (0 for the root).
    pub created_round: u32,
}

/// Lifecycle of a task. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    fn can_move_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Done)
                | (
                    TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running,
                    TaskStatus::Failed
                )
        )
    }
}

/// A unit of work produced by a planner for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub scope: ScopeId,
    pub round: u32,
    pub description: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        scope: ScopeId,
        round: u32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            scope,
            round,
            description: description.into(),
            status: TaskStatus::Pending,
        }
    }

    /// Move the task forward; backwards or out-of-terminal moves are rejected.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), String> {
        if !self.status.can_move_to(next) {
            return Err(format!(
                "task '{}' cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            ));
        }
        self.status = next;
        Ok(())
    }
}

/// Outcome recorded on a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Done,
    Failed,
    /// The worker hit its iteration cap without writing a final document.
    Incomplete,
}

impl HandoffStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandoffStatus::Done => "done",
            HandoffStatus::Failed => "failed",
            HandoffStatus::Incomplete => "incomplete",
        }
    }
}

/// Who wrote a handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Producer {
    Worker { task_id: String },
    Planner { scope: ScopeId },
}

/// The single result document produced for a task (or a failed planner run).
///
/// Fields are private: a handoff is immutable once produced and is only ever
/// read through shared references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    scope: ScopeId,
    round: u32,
    producer: Producer,
    status: HandoffStatus,
    summary: String,
    notes: String,
    concerns: Vec<String>,
}

impl Handoff {
    pub fn from_worker(
        task: &Task,
        status: HandoffStatus,
        summary: impl Into<String>,
        notes: impl Into<String>,
        concerns: Vec<String>,
    ) -> Self {
        Self {
            scope: task.scope.clone(),
            round: task.round,
            producer: Producer::Worker {
                task_id: task.id.clone(),
            },
            status,
            summary: summary.into(),
            notes: notes.into(),
            concerns,
        }
    }

    /// Handoff recorded when a planner could not produce usable output.
    pub fn planner_failure(scope: &ScopeId, round: u32, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            scope: scope.clone(),
            round,
            producer: Producer::Planner {
                scope: scope.clone(),
            },
            status: HandoffStatus::Failed,
            summary: format!("planner for scope '{scope}' produced no usable plan"),
            notes: String::new(),
            concerns: vec![reason],
        }
    }

    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn task_id(&self) -> Option<&str> {
        match &self.producer {
            Producer::Worker { task_id } => Some(task_id),
            Producer::Planner { .. } => None,
        }
    }

    pub fn status(&self) -> HandoffStatus {
        self.status
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn concerns(&self) -> &[String] {
        &self.concerns
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    Conflict,
    Timeout,
    InvalidArguments,
    UnknownTool,
    Io,
}

/// Result of a tool call, fed back to the model on the next iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolObservation {
    Ok { output: String },
    Error { kind: ToolErrorKind, message: String },
}

impl ToolObservation {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolObservation::Error { .. })
    }
}

/// A model's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelResponse {
    Text { text: String },
    ToolCall(ToolInvocation),
}

/// Classification of a single model call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    Transient,
    Fatal,
}

/// One request to one model id within a logical call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAttempt {
    pub call_id: String,
    pub model: String,
    /// 0-indexed attempt number on this model.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Backoff slept before the next attempt on the same model, if any.
    pub delay_ms: Option<u64>,
    pub detail: Option<String>,
}

/// Component that produced a session log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Controller,
    Planner,
    Worker,
    Gateway,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Converged,
    RoundLimitReached,
    FatalError { round: u32, message: String },
}

impl TerminalState {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalState::Converged => "converged",
            TerminalState::RoundLimitReached => "round-limit-reached",
            TerminalState::FatalError { .. } => "fatal-error",
        }
    }
}
