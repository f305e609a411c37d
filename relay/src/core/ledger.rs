//! Append-only handoff ledger shared by all planners.

use std::collections::BTreeMap;

use crate::core::planner_tree::PlannerTree;
use crate::core::transcript::truncate_back;
use crate::core::types::{Handoff, ScopeId};

/// Every handoff collected so far, in arrival order.
///
/// Handoffs are never edited or removed; planners only ever see shared
/// references to them.
#[derive(Debug, Clone, Default)]
pub struct HandoffLedger {
    handoffs: Vec<Handoff>,
}

impl HandoffLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handoff: Handoff) {
        self.handoffs.push(handoff);
    }

    pub fn all(&self) -> &[Handoff] {
        &self.handoffs
    }

    pub fn len(&self) -> usize {
        self.handoffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handoffs.is_empty()
    }

    /// Handoffs grouped by the scope that produced them.
    pub fn by_scope(&self) -> BTreeMap<ScopeId, Vec<Handoff>> {
        let mut grouped: BTreeMap<ScopeId, Vec<Handoff>> = BTreeMap::new();
        for handoff in &self.handoffs {
            grouped
                .entry(handoff.scope().clone())
                .or_default()
                .push(handoff.clone());
        }
        grouped
    }

    /// Handoffs the planner of `scope` consumes: its own scope and every
    /// descendant scope. The root therefore sees everything.
    pub fn visible_to<'a>(&'a self, tree: &PlannerTree, scope: &ScopeId) -> Vec<&'a Handoff> {
        self.handoffs
            .iter()
            .filter(|handoff| tree.is_within(handoff.scope(), scope))
            .collect()
    }
}

/// Render handoffs for a planner prompt, newest kept first when the budget is
/// tight. Output lists kept handoffs oldest first.
pub fn render_handoffs(handoffs: &[&Handoff], budget: usize) -> String {
    let mut kept = Vec::new();
    let mut used = 0usize;
    let mut omitted = 0usize;
    for handoff in handoffs.iter().rev() {
        let rendered = render_handoff(handoff);
        if used + rendered.len() > budget {
            omitted += 1;
            continue;
        }
        used += rendered.len();
        kept.push(rendered);
    }
    kept.reverse();
    let mut out = kept.join("\n");
    if omitted > 0 {
        out.insert_str(0, &format!("[{omitted} older handoffs omitted]\n\n"));
    }
    out
}

fn render_handoff(handoff: &Handoff) -> String {
    let producer = match handoff.task_id() {
        Some(task_id) => format!("task {task_id}"),
        None => "planner".to_string(),
    };
    let mut out = format!(
        "#### [{}] round {} scope {} ({producer})\n{}\n",
        handoff.status().as_str(),
        handoff.round(),
        handoff.scope(),
        truncate_back(handoff.summary().trim(), 4_000),
    );
    if !handoff.notes().trim().is_empty() {
        out.push_str(&format!(
            "Notes: {}\n",
            truncate_back(handoff.notes().trim(), 2_000)
        ));
    }
    for concern in handoff.concerns() {
        out.push_str(&format!("- concern: {concern}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Delegation;
    use crate::core::types::{HandoffStatus, Task};

    fn handoff(scope: &str, task_id: &str, summary: &str) -> Handoff {
        let task = Task::new(task_id, ScopeId::new(scope), 1, "work");
        Handoff::from_worker(&task, HandoffStatus::Done, summary, "", Vec::new())
    }

    fn tree() -> PlannerTree {
        let mut tree = PlannerTree::new("goal");
        for (parent, name) in [("root", "api"), ("api", "auth"), ("root", "docs")] {
            tree.delegate(
                &ScopeId::new(parent),
                &Delegation {
                    scope: name.to_string(),
                    description: String::new(),
                    boundary: None,
                },
                1,
            )
            .expect("delegate");
        }
        tree
    }

    /// Ancestors see descendant handoffs; siblings do not see each other.
    #[test]
    fn visibility_follows_scope_ancestry() {
        let tree = tree();
        let mut ledger = HandoffLedger::new();
        ledger.push(handoff("auth", "t1", "login"));
        ledger.push(handoff("docs", "t2", "readme"));
        ledger.push(handoff("root", "t3", "ci"));

        assert_eq!(ledger.visible_to(&tree, &ScopeId::root()).len(), 3);
        let api: Vec<_> = ledger
            .visible_to(&tree, &ScopeId::new("api"))
            .iter()
            .map(|h| h.summary().to_string())
            .collect();
        assert_eq!(api, vec!["login"]);
        assert_eq!(ledger.visible_to(&tree, &ScopeId::new("docs")).len(), 1);
        assert_eq!(ledger.by_scope().len(), 3);
    }

    #[test]
    fn rendering_keeps_newest_within_budget() {
        let first = handoff("root", "t1", &"a".repeat(200));
        let second = handoff("root", "t2", "latest result");
        let rendered = render_handoffs(&[&first, &second], 120);
        assert!(rendered.starts_with("[1 older handoffs omitted]"));
        assert!(rendered.contains("latest result"));
        assert!(!rendered.contains("aaaa"));
    }
}
