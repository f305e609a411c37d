//! Prompt builder for planner and worker model requests.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Scope, Task};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");

/// Drop order when a rendered prompt exceeds its budget.
const DROP_ORDER: [&str; 4] = ["children", "goal", "handoffs", "transcript"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex is valid")
});

#[derive(Debug, Clone, Serialize)]
struct ScopeContext {
    id: String,
    parent: Option<String>,
    description: String,
    boundary: Option<String>,
}

impl ScopeContext {
    fn from_scope(scope: &Scope) -> Self {
        Self {
            id: scope.id.to_string(),
            parent: scope.parent.as_ref().map(ToString::to_string),
            description: scope.description.trim().to_string(),
            boundary: scope
                .boundary
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChildContext {
    id: String,
    description: String,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    scope: String,
    description: String,
}

/// Inputs for one planner invocation.
#[derive(Debug, Clone)]
pub struct PlannerPromptInputs<'a> {
    pub goal: &'a str,
    pub scope: &'a Scope,
    /// Sub-scopes already delegated from this scope.
    pub children: Vec<&'a Scope>,
    /// Pre-rendered handoffs visible to this planner.
    pub handoffs: String,
    pub round: u32,
    pub max_rounds: u32,
}

/// Inputs for one worker model turn.
#[derive(Debug, Clone)]
pub struct WorkerPromptInputs<'a> {
    pub goal: &'a str,
    pub task: &'a Task,
    pub scope: &'a Scope,
    /// Pre-rendered tail of the tool loop transcript.
    pub transcript: String,
    pub iteration: u32,
    pub max_iterations: u32,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("worker", WORKER_TEMPLATE)
            .context("load worker template")?;
        Ok(Self { env })
    }

    fn render_planner(&self, input: &PlannerPromptInputs<'_>) -> Result<String> {
        let children: Vec<ChildContext> = input
            .children
            .iter()
            .map(|child| ChildContext {
                id: child.id.to_string(),
                description: child.description.trim().to_string(),
            })
            .collect();
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            goal => input.goal.trim(),
            scope => ScopeContext::from_scope(input.scope),
            children => children,
            handoffs => (!input.handoffs.trim().is_empty()).then(|| input.handoffs.trim()),
            round => input.round,
            max_rounds => input.max_rounds,
        })?;
        Ok(rendered)
    }

    fn render_worker(&self, input: &WorkerPromptInputs<'_>) -> Result<String> {
        let task = TaskContext {
            id: input.task.id.clone(),
            scope: input.task.scope.to_string(),
            description: input.task.description.trim().to_string(),
        };
        let template = self.env.get_template("worker")?;
        let rendered = template.render(context! {
            goal => input.goal.trim(),
            task => task,
            scope => ScopeContext::from_scope(input.scope),
            transcript => (!input.transcript.trim().is_empty()).then(|| input.transcript.trim()),
            iteration => input.iteration,
            max_iterations => input.max_iterations,
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content without its marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(matches.len());

    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop droppable sections in `DROP_ORDER` until the prompt fits, then
/// truncate the last section if required sections alone exceed the budget.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let other_len = total - sections.last().map_or(0, |s| s.content.len());
    if let Some(last) = sections.last_mut() {
        let allowed = budget.saturating_sub(other_len);
        let before_len = last.content.len();
        let mut cut = allowed.saturating_sub(12).min(before_len);
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn build_planner(&self, input: &PlannerPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_planner(input)
            .context("render planner prompt")?;
        Ok(self.fit(&rendered))
    }

    pub fn build_worker(&self, input: &WorkerPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_worker(input)
            .context("render worker prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}
