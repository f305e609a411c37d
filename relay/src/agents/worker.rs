//! Worker agent: drives the tool loop for one task in one repository copy.

use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::tool_loop::{LoopAction, LoopExit, ToolLoop};
use crate::core::types::{Actor, Handoff, HandoffStatus, Scope, Task};
use crate::io::gateway::ModelGateway;
use crate::io::model::{ModelBackend, ModelRequest, ToolSpec};
use crate::io::prompt::{PromptBuilder, WorkerPromptInputs};
use crate::io::repo_copy::RepoCopy;
use crate::io::session_log::{SessionLogger, event};
use crate::io::tools::{ToolExecutor, tool_specs};

/// Transcript tail kept as a concern when a worker runs out of iterations.
const CAP_TRANSCRIPT_BYTES: usize = 2_000;

/// Worker agent shared by every pool thread of a round.
pub struct WorkerAgent<'a, B, T> {
    gateway: &'a ModelGateway<B>,
    tools: &'a T,
    log: SessionLogger,
    prompt: PromptBuilder,
    tool_specs: Vec<ToolSpec>,
    max_iterations: u32,
    goal: &'a str,
}

impl<'a, B: ModelBackend, T: ToolExecutor> WorkerAgent<'a, B, T> {
    pub fn new(
        gateway: &'a ModelGateway<B>,
        tools: &'a T,
        log: SessionLogger,
        prompt_budget_bytes: usize,
        max_iterations: u32,
        goal: &'a str,
    ) -> Self {
        Self {
            gateway,
            tools,
            log,
            prompt: PromptBuilder::new(prompt_budget_bytes),
            tool_specs: tool_specs(),
            max_iterations,
            goal,
        }
    }

    /// Run the tool loop to completion. Always yields exactly one handoff.
    #[instrument(skip_all, fields(task = %task.id, scope = %task.scope))]
    pub fn execute(&self, task: &Task, scope: &Scope, copy: &RepoCopy) -> Handoff {
        let mut tool_loop = ToolLoop::new(self.max_iterations);
        loop {
            match tool_loop.next_action() {
                LoopAction::CallModel { iteration } => {
                    let transcript = tool_loop
                        .transcript()
                        .render_tail(self.prompt.budget_bytes() / 2);
                    let prompt = match self.prompt.build_worker(&WorkerPromptInputs {
                        goal: self.goal,
                        task,
                        scope,
                        transcript,
                        iteration,
                        max_iterations: tool_loop.max_iterations(),
                    }) {
                        Ok(prompt) => prompt,
                        Err(err) => {
                            tool_loop.on_provider_failure(format!("build worker prompt: {err:#}"));
                            continue;
                        }
                    };
                    let request = ModelRequest {
                        actor: Actor::Worker,
                        actor_id: task.id.clone(),
                        prompt,
                        tools: self.tool_specs.clone(),
                    };
                    match self.gateway.complete(&request) {
                        Ok(completion) => tool_loop.on_model_response(completion.response),
                        Err(err) => {
                            warn!(error = %err, iteration, "worker model call failed");
                            tool_loop.on_provider_failure(err.to_string());
                        }
                    }
                }
                LoopAction::RunTool(invocation) => {
                    self.log
                        .record(Actor::Worker, &task.id, event::TOOL_CALL, &invocation);
                    let observation = self.tools.execute(copy, &invocation);
                    debug!(
                        tool = %invocation.name,
                        error = observation.is_error(),
                        "tool observation"
                    );
                    self.log.record(
                        Actor::Worker,
                        &task.id,
                        event::TOOL_OBSERVATION,
                        &json!({ "tool": invocation.name, "observation": observation }),
                    );
                    tool_loop.on_observation(observation);
                }
                LoopAction::Done => break,
            }
        }

        let max_iterations = tool_loop.max_iterations();
        let (exit, transcript) = tool_loop.finish();
        let handoff = match exit {
            LoopExit::Completed(draft) => Handoff::from_worker(
                task,
                draft.status,
                draft.summary,
                draft.notes,
                draft.concerns,
            ),
            LoopExit::IterationCapReached => Handoff::from_worker(
                task,
                HandoffStatus::Incomplete,
                format!("stopped after {max_iterations} iterations without a handoff"),
                "",
                vec![format!(
                    "last transcript entries:\n{}",
                    transcript.render_tail(CAP_TRANSCRIPT_BYTES)
                )],
            ),
            LoopExit::ProviderFailed(message) => Handoff::from_worker(
                task,
                HandoffStatus::Failed,
                "model provider failed before the task finished",
                "",
                vec![message],
            ),
        };
        self.log
            .record(Actor::Worker, &task.id, event::HANDOFF, &handoff);
        handoff
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::core::backoff::Backoff;
    use crate::core::types::{ScopeId, ToolInvocation, ToolObservation};
    use crate::io::gateway::GatewayPolicy;
    use crate::io::model::BackendError;
    use crate::test_support::{FnBackend, ScriptedBackend, no_sleep, text, tool_call};

    struct NoTools;

    impl ToolExecutor for NoTools {
        fn execute(&self, _copy: &RepoCopy, invocation: &ToolInvocation) -> ToolObservation {
            ToolObservation::Ok {
                output: format!("ran {}", invocation.name),
            }
        }
    }

    fn policy() -> GatewayPolicy {
        GatewayPolicy {
            primary: "m".to_string(),
            fallbacks: Vec::new(),
            max_retries: 1,
            backoff: Backoff::from_secs_f64(0.0, 0.0),
        }
    }

    fn scope() -> Scope {
        Scope {
            id: ScopeId::root(),
            name: "root".to_string(),
            description: "goal".to_string(),
            boundary: None,
            parent: None,
            created_round: 0,
        }
    }

    /// Verifies a tool call followed by a handoff produces a completed handoff
    /// and that the observation is fed into the next prompt.
    #[test]
    fn tool_call_then_handoff_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let copy = RepoCopy::new("c1", temp.path().to_path_buf());
        let backend = ScriptedBackend::new();
        backend.push("m", Ok(tool_call("run_cmd", json!({ "command": "ls" }))));
        backend.push(
            "m",
            Ok(text("## Handoff\nstatus: done\n### Summary\nlisted files")),
        );
        let gateway = ModelGateway::new(&backend, policy(), SessionLogger::disabled())
            .with_sleeper(no_sleep);
        let task = Task::new("r1-root-1", ScopeId::root(), 1, "list files");

        let worker = WorkerAgent::new(
            &gateway,
            &NoTools,
            SessionLogger::disabled(),
            60_000,
            20,
            "goal",
        );
        let handoff = worker.execute(&task, &scope(), &copy);

        assert_eq!(handoff.status(), HandoffStatus::Done);
        assert_eq!(handoff.summary(), "listed files");
        assert_eq!(handoff.task_id(), Some("r1-root-1"));
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 3);
        assert!(requests[1].prompt.contains("ran run_cmd"));
    }

    /// Verifies a model that never hands off stops at the iteration cap with
    /// an incomplete handoff.
    #[test]
    fn iteration_cap_yields_incomplete_handoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let copy = RepoCopy::new("c1", temp.path().to_path_buf());
        let backend = FnBackend::new(|_request: &ModelRequest, _model: &str| {
            Ok(tool_call("read_file", json!({ "path": "a.txt" })))
        });
        let gateway = ModelGateway::new(&backend, policy(), SessionLogger::disabled())
            .with_sleeper(no_sleep);
        let task = Task::new("r1-root-1", ScopeId::root(), 1, "loop forever");

        let worker = WorkerAgent::new(
            &gateway,
            &NoTools,
            SessionLogger::disabled(),
            60_000,
            3,
            "goal",
        );
        let handoff = worker.execute(&task, &scope(), &copy);

        assert_eq!(handoff.status(), HandoffStatus::Incomplete);
        assert!(handoff.summary().contains("3 iterations"));
        assert!(handoff.concerns()[0].contains("read_file"));
        assert_eq!(backend.calls(), 3);
    }

    /// Verifies gateway exhaustion ends the loop with a failed handoff.
    #[test]
    fn provider_failure_yields_failed_handoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "a").expect("write");
        let copy = RepoCopy::new("c1", temp.path().to_path_buf());
        let backend = ScriptedBackend::new();
        backend.push("m", Err(BackendError::Fatal("bad key".to_string())));
        let gateway = ModelGateway::new(&backend, policy(), SessionLogger::disabled())
            .with_sleeper(no_sleep);
        let task = Task::new("r1-root-1", ScopeId::root(), 1, "do it");

        let handoff = WorkerAgent::new(
            &gateway,
            &NoTools,
            SessionLogger::disabled(),
            60_000,
            20,
            "goal",
        )
        .execute(&task, &scope(), &copy);

        assert_eq!(handoff.status(), HandoffStatus::Failed);
        assert!(handoff.concerns()[0].contains("bad key"));
    }
}
