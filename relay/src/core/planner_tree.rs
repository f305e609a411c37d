//! The dynamic set of planners, one per scope.
//!
//! The tree is an explicit map from scope id to planner state with a parent
//! pointer per scope. Delegation only ever creates a fresh child or reuses an
//! existing scope without re-parenting it, so the tree cannot become cyclic.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::core::plan::Delegation;
use crate::core::types::{ROOT_SCOPE, Scope, ScopeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error("delegated scope name '{0}' normalizes to an empty slug")]
    EmptyName(String),
    #[error("delegated scope name '{0}' is reserved")]
    ReservedName(String),
    #[error("unknown delegating scope '{0}'")]
    UnknownParent(ScopeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationOutcome {
    Created(ScopeId),
    /// The slug already existed somewhere in the tree.
    Reused(ScopeId),
}

impl DelegationOutcome {
    pub fn scope(&self) -> &ScopeId {
        match self {
            DelegationOutcome::Created(id) | DelegationOutcome::Reused(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannerState {
    pub scope: Scope,
    pub children: Vec<ScopeId>,
    pub last_run_round: Option<u32>,
    /// Number of visible handoffs when the planner last ran.
    pub seen_handoffs: usize,
    /// Last run produced no tasks and no delegations.
    pub complete: bool,
    pub runs: u32,
}

impl PlannerState {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            children: Vec::new(),
            last_run_round: None,
            seen_handoffs: 0,
            complete: false,
            runs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerTree {
    planners: BTreeMap<ScopeId, PlannerState>,
    /// Scope ids in creation order.
    order: Vec<ScopeId>,
}

impl PlannerTree {
    /// Tree holding only the root scope, described by the session goal.
    pub fn new(goal: &str) -> Self {
        let root = Scope {
            id: ScopeId::root(),
            name: ROOT_SCOPE.to_string(),
            description: goal.to_string(),
            boundary: None,
            parent: None,
            created_round: 0,
        };
        let mut planners = BTreeMap::new();
        planners.insert(root.id.clone(), PlannerState::new(root));
        Self {
            planners,
            order: vec![ScopeId::root()],
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &ScopeId) -> Option<&PlannerState> {
        self.planners.get(id)
    }

    pub fn contains(&self, id: &ScopeId) -> bool {
        self.planners.contains_key(id)
    }

    /// Scope ids in creation order (root first).
    pub fn order(&self) -> &[ScopeId] {
        &self.order
    }

    pub fn scopes(&self) -> impl Iterator<Item = &Scope> {
        self.order
            .iter()
            .filter_map(|id| self.planners.get(id).map(|state| &state.scope))
    }

    /// Record a delegation from `parent`.
    ///
    /// Idempotent per slug across the whole tree: delegating a name whose slug
    /// already exists returns the existing scope untouched.
    pub fn delegate(
        &mut self,
        parent: &ScopeId,
        delegation: &Delegation,
        round: u32,
    ) -> Result<DelegationOutcome, DelegationError> {
        if !self.planners.contains_key(parent) {
            return Err(DelegationError::UnknownParent(parent.clone()));
        }
        let slug = scope_slug(&delegation.scope);
        if slug.is_empty() {
            return Err(DelegationError::EmptyName(delegation.scope.clone()));
        }
        if slug == ROOT_SCOPE {
            return Err(DelegationError::ReservedName(delegation.scope.clone()));
        }

        let id = ScopeId::new(slug);
        if self.planners.contains_key(&id) {
            return Ok(DelegationOutcome::Reused(id));
        }

        let scope = Scope {
            id: id.clone(),
            name: delegation.scope.clone(),
            description: delegation.description.clone(),
            boundary: delegation
                .boundary
                .clone()
                .filter(|b| !b.trim().is_empty()),
            parent: Some(parent.clone()),
            created_round: round,
        };
        self.planners.insert(id.clone(), PlannerState::new(scope));
        self.order.push(id.clone());
        if let Some(parent_state) = self.planners.get_mut(parent) {
            parent_state.children.push(id.clone());
        }
        Ok(DelegationOutcome::Created(id))
    }

    /// `scope` followed by its ancestors up to the root.
    pub fn lineage(&self, scope: &ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(scope.clone());
        while let Some(id) = cursor {
            let parent = self
                .planners
                .get(&id)
                .and_then(|state| state.scope.parent.clone());
            chain.push(id);
            if chain.len() > self.planners.len() {
                break;
            }
            cursor = parent;
        }
        chain
    }

    /// Whether `scope` equals `ancestor` or descends from it.
    pub fn is_within(&self, scope: &ScopeId, ancestor: &ScopeId) -> bool {
        self.lineage(scope).iter().any(|id| id == ancestor)
    }

    /// Whether the planner for `scope` should run given the number of
    /// handoffs currently visible to it.
    ///
    /// The root always runs. Other planners run when they never ran, or when
    /// new handoffs became visible since their last run.
    pub fn needs_attention(&self, scope: &ScopeId, visible_handoffs: usize) -> bool {
        if scope.is_root() {
            return true;
        }
        match self.planners.get(scope) {
            Some(state) => state.last_run_round.is_none() || visible_handoffs > state.seen_handoffs,
            None => false,
        }
    }

    pub fn mark_ran(&mut self, scope: &ScopeId, round: u32, seen_handoffs: usize, complete: bool) {
        if let Some(state) = self.planners.get_mut(scope) {
            state.last_run_round = Some(round);
            state.seen_handoffs = seen_handoffs;
            state.complete = complete;
            state.runs += 1;
        }
    }
}

/// Normalize a delegated scope name: lowercase ASCII alphanumerics separated
/// by single dashes.
pub fn scope_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegation(scope: &str) -> Delegation {
        Delegation {
            scope: scope.to_string(),
            description: format!("{scope} work"),
            boundary: None,
        }
    }

    #[test]
    fn slug_normalizes_names() {
        assert_eq!(scope_slug("Auth"), "auth");
        assert_eq!(scope_slug("  User Auth / Login "), "user-auth-login");
        assert_eq!(scope_slug("db__schema"), "db-schema");
        assert_eq!(scope_slug("!!!"), "");
    }

    /// Delegating the same name twice (even with different spelling or from a
    /// different parent) keeps a single planner.
    #[test]
    fn delegation_is_idempotent_per_slug() {
        let mut tree = PlannerTree::new("goal");
        let root = ScopeId::root();

        let first = tree.delegate(&root, &delegation("auth"), 1).expect("first");
        assert_eq!(first, DelegationOutcome::Created(ScopeId::new("auth")));

        let api = tree.delegate(&root, &delegation("api"), 1).expect("api");
        let again = tree
            .delegate(api.scope(), &delegation("Auth"), 2)
            .expect("again");
        assert_eq!(again, DelegationOutcome::Reused(ScopeId::new("auth")));

        assert_eq!(tree.len(), 3);
        let auth = tree.get(&ScopeId::new("auth")).expect("auth");
        assert_eq!(auth.scope.parent, Some(root.clone()));
        assert_eq!(auth.scope.created_round, 1);
        assert_eq!(tree.get(&root).expect("root").children.len(), 2);
    }

    #[test]
    fn rejects_reserved_and_empty_names() {
        let mut tree = PlannerTree::new("goal");
        let root = ScopeId::root();
        assert_eq!(
            tree.delegate(&root, &delegation("Root"), 1),
            Err(DelegationError::ReservedName("Root".to_string()))
        );
        assert!(matches!(
            tree.delegate(&root, &delegation("--"), 1),
            Err(DelegationError::EmptyName(_))
        ));
        assert!(matches!(
            tree.delegate(&ScopeId::new("ghost"), &delegation("x"), 1),
            Err(DelegationError::UnknownParent(_))
        ));
    }

    #[test]
    fn lineage_walks_to_root() {
        let mut tree = PlannerTree::new("goal");
        tree.delegate(&ScopeId::root(), &delegation("api"), 1)
            .expect("api");
        tree.delegate(&ScopeId::new("api"), &delegation("auth"), 1)
            .expect("auth");

        let lineage = tree.lineage(&ScopeId::new("auth"));
        assert_eq!(
            lineage,
            vec![ScopeId::new("auth"), ScopeId::new("api"), ScopeId::root()]
        );
        assert!(tree.is_within(&ScopeId::new("auth"), &ScopeId::root()));
        assert!(!tree.is_within(&ScopeId::new("api"), &ScopeId::new("auth")));
    }

    #[test]
    fn attention_follows_new_handoffs() {
        let mut tree = PlannerTree::new("goal");
        let auth = tree
            .delegate(&ScopeId::root(), &delegation("auth"), 1)
            .expect("auth")
            .scope()
            .clone();

        assert!(tree.needs_attention(&auth, 0), "never ran");
        tree.mark_ran(&auth, 1, 0, true);
        assert!(!tree.needs_attention(&auth, 0), "complete, nothing new");
        assert!(tree.needs_attention(&auth, 1), "new handoff");
        assert!(tree.needs_attention(&ScopeId::root(), 0), "root always runs");
        assert_eq!(tree.get(&auth).expect("auth").runs, 1);
    }
}
