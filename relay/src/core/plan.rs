//! Planner output contract.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n?\s*```\s*$").expect("fence regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannedTask {
    pub description: String,
}

/// Request to hand a sub-scope to its own planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delegation {
    pub scope: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<String>,
}

/// What one planner invocation produced, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerOutput {
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub delegations: Vec<Delegation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PlannerOutput {
    /// No tasks and no delegations: the planner considers its scope complete.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.delegations.is_empty()
    }
}

/// Strip an optional markdown code fence around a JSON payload.
pub fn extract_json_object(text: &str) -> &str {
    match FENCE_RE.captures(text).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text.trim(),
    }
}
