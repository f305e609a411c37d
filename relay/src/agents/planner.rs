//! Planner agent: one gateway call per invocation, no tools.

use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::ledger::render_handoffs;
use crate::core::plan::{PlannerOutput, extract_json_object};
use crate::core::types::{Actor, Handoff, ModelResponse, Scope};
use crate::io::gateway::{GatewayError, ModelGateway};
use crate::io::model::{ModelBackend, ModelRequest};
use crate::io::prompt::{PlannerPromptInputs, PromptBuilder};

const PLANNER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

static PLANNER_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PLANNER_OUTPUT_SCHEMA)
        .map_err(|err| format!("parse planner schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid planner schema: {err}"))
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Provider(#[from] GatewayError),
    #[error("planner requested tool '{0}' but planners cannot call tools")]
    ToolCall(String),
    #[error("malformed planner output: {0}")]
    Malformed(String),
    #[error("planner prompt: {0}")]
    Prompt(String),
}

/// Everything one planner invocation sees.
#[derive(Debug, Clone)]
pub struct PlannerRequest<'a> {
    pub goal: &'a str,
    pub scope: &'a Scope,
    pub children: Vec<&'a Scope>,
    /// Handoffs of this scope and its descendants, oldest first.
    pub handoffs: Vec<&'a Handoff>,
    pub round: u32,
    pub max_rounds: u32,
}

/// Planner agent wrapper that owns prompt settings.
#[derive(Debug, Clone)]
pub struct PlannerAgent {
    prompt: PromptBuilder,
}

impl PlannerAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompt: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    #[instrument(skip_all, fields(scope = %request.scope.id, round = request.round))]
    pub fn run<B: ModelBackend>(
        &self,
        gateway: &ModelGateway<B>,
        request: &PlannerRequest<'_>,
    ) -> Result<PlannerOutput, PlannerError> {
        // Handoffs get at most half the budget; the rest of the prompt is small.
        let handoffs = render_handoffs(&request.handoffs, self.prompt.budget_bytes() / 2);
        let prompt = self
            .prompt
            .build_planner(&PlannerPromptInputs {
                goal: request.goal,
                scope: request.scope,
                children: request.children.clone(),
                handoffs,
                round: request.round,
                max_rounds: request.max_rounds,
            })
            .map_err(|err| PlannerError::Prompt(format!("{err:#}")))?;

        let completion = gateway.complete(&ModelRequest {
            actor: Actor::Planner,
            actor_id: request.scope.id.to_string(),
            prompt,
            tools: Vec::new(),
        })?;

        match completion.response {
            ModelResponse::Text { text } => {
                let output = parse_planner_output(&text).map_err(PlannerError::Malformed)?;
                debug!(
                    tasks = output.tasks.len(),
                    delegations = output.delegations.len(),
                    "planner output parsed"
                );
                Ok(output)
            }
            ModelResponse::ToolCall(invocation) => Err(PlannerError::ToolCall(invocation.name)),
        }
    }
}

/// Parse and schema-validate a planner reply, tolerating a code fence.
pub fn parse_planner_output(text: &str) -> Result<PlannerOutput, String> {
    let json = extract_json_object(text);
    let value: Value = serde_json::from_str(json).map_err(|err| format!("not JSON: {err}"))?;
    let validator = PLANNER_VALIDATOR.as_ref().map_err(Clone::clone)?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(format!("schema validation failed: {}", messages.join("; ")));
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}
