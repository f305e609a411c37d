//! Round controller: planning phase, worker phase, handoff collection.
//!
//! Each round runs the planners that need attention (root first, then every
//! scope with a fresh delegation or new visible handoffs, in creation order),
//! dispatches the union of their tasks to the worker pool and appends the
//! resulting handoffs at the round boundary. Planning is sequential, so every
//! planner of a phase sees the same handoff set.

use std::collections::{BTreeMap, VecDeque};

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::planner::{PlannerAgent, PlannerError, PlannerRequest};
use crate::agents::worker::WorkerAgent;
use crate::core::ledger::HandoffLedger;
use crate::core::planner_tree::{DelegationOutcome, PlannerTree};
use crate::core::types::{Actor, Handoff, Scope, ScopeId, Task, TerminalState};
use crate::io::config::RelayConfig;
use crate::io::gateway::ModelGateway;
use crate::io::model::ModelBackend;
use crate::io::repo_copy::RepoCopyService;
use crate::io::session_log::{SessionLogger, event};
use crate::io::tools::ToolExecutor;
use crate::pool::{WorkItem, WorkerPool};

/// Controller knobs taken from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSettings {
    pub max_workers: usize,
    pub max_iterations: u32,
    pub prompt_budget_bytes: usize,
}

impl RoundSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            max_iterations: config.max_iterations,
            prompt_budget_bytes: config.prompt_budget_bytes,
        }
    }
}

/// Everything a session produced, whatever its terminal state.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub terminal: TerminalState,
    /// Rounds whose planning phase produced tasks or new sub-planners.
    pub rounds: u32,
    pub tree: PlannerTree,
    pub handoffs: HandoffLedger,
    /// Every task in its terminal status, in dispatch order.
    pub tasks: Vec<Task>,
}

impl SessionOutcome {
    pub fn handoffs_by_scope(&self) -> BTreeMap<ScopeId, Vec<Handoff>> {
        self.handoffs.by_scope()
    }
}

/// Output of one planning phase.
#[derive(Debug, Default)]
struct PlanningPhase {
    work: Vec<WorkItem>,
    new_scopes: usize,
    failures: Vec<Handoff>,
}

impl PlanningPhase {
    /// No new tasks and no new sub-planners. Planner failures do not keep the
    /// session alive.
    fn is_quiet(&self) -> bool {
        self.work.is_empty() && self.new_scopes == 0
    }
}

pub struct RoundController<'a, B, T, C> {
    gateway: &'a ModelGateway<B>,
    tools: &'a T,
    copies: &'a C,
    log: SessionLogger,
    settings: RoundSettings,
}

impl<'a, B, T, C> RoundController<'a, B, T, C>
where
    B: ModelBackend,
    T: ToolExecutor,
    C: RepoCopyService,
{
    pub fn new(
        gateway: &'a ModelGateway<B>,
        tools: &'a T,
        copies: &'a C,
        log: SessionLogger,
        settings: RoundSettings,
    ) -> Self {
        Self {
            gateway,
            tools,
            copies,
            log,
            settings,
        }
    }

    /// Run rounds until convergence, the round limit or a fatal root planner
    /// failure. Never aborts for a single task failure.
    #[instrument(skip_all, fields(max_rounds = max_rounds))]
    pub fn run(&self, goal: &str, max_rounds: u32) -> SessionOutcome {
        let max_rounds = max_rounds.max(1);
        let planner = PlannerAgent::new(self.settings.prompt_budget_bytes);
        let worker = WorkerAgent::new(
            self.gateway,
            self.tools,
            self.log.clone(),
            self.settings.prompt_budget_bytes,
            self.settings.max_iterations,
            goal,
        );
        let pool = WorkerPool::new(self.settings.max_workers, self.log.clone());

        let mut tree = PlannerTree::new(goal);
        let mut ledger = HandoffLedger::new();
        let mut tasks = Vec::new();
        let mut rounds = 0u32;

        let terminal = loop {
            if rounds >= max_rounds {
                break TerminalState::RoundLimitReached;
            }
            let round = rounds + 1;
            self.record(event::ROUND_STARTED, &json!({ "round": round }));

            let phase = match self.plan(&planner, &mut tree, &ledger, goal, round, max_rounds) {
                Ok(phase) => phase,
                Err(message) => {
                    warn!(round, %message, "root planner failed");
                    break TerminalState::FatalError { round, message };
                }
            };
            if phase.is_quiet() {
                info!(
                    round,
                    planner_failures = phase.failures.len(),
                    "planning phase produced no work; converged"
                );
                self.append_failures(&mut ledger, phase.failures);
                break TerminalState::Converged;
            }

            info!(
                round,
                tasks = phase.work.len(),
                new_scopes = phase.new_scopes,
                planner_failures = phase.failures.len(),
                "dispatching round"
            );
            let PlanningPhase { work, failures, .. } = phase;
            let results = pool.submit(&worker, self.copies, work);
            let completed = results.len();
            self.append_failures(&mut ledger, failures);
            for result in results {
                ledger.push(result.handoff);
                tasks.push(result.task);
            }
            rounds = round;
            self.record(
                event::ROUND_FINISHED,
                &json!({ "round": round, "tasks": completed, "handoffs": ledger.len() }),
            );
        };

        SessionOutcome {
            terminal,
            rounds,
            tree,
            handoffs: ledger,
            tasks,
        }
    }

    /// One planning phase. `Err` carries the message of a fatal root planner
    /// failure (gateway exhausted).
    fn plan(
        &self,
        planner: &PlannerAgent,
        tree: &mut PlannerTree,
        ledger: &HandoffLedger,
        goal: &str,
        round: u32,
        max_rounds: u32,
    ) -> Result<PlanningPhase, String> {
        let mut phase = PlanningPhase::default();
        let mut worklist: VecDeque<ScopeId> = {
            let snapshot: &PlannerTree = tree;
            snapshot
                .order()
                .iter()
                .filter(|id| snapshot.needs_attention(id, ledger.visible_to(snapshot, id).len()))
                .cloned()
                .collect()
        };

        while let Some(scope_id) = worklist.pop_front() {
            let Some(state) = tree.get(&scope_id) else {
                continue;
            };
            let scope = state.scope.clone();
            let children: Vec<Scope> = state
                .children
                .iter()
                .filter_map(|child| tree.get(child).map(|s| s.scope.clone()))
                .collect();
            let visible = ledger.visible_to(tree, &scope_id);
            let seen = visible.len();

            let result = planner.run(
                self.gateway,
                &PlannerRequest {
                    goal,
                    scope: &scope,
                    children: children.iter().collect(),
                    handoffs: visible,
                    round,
                    max_rounds,
                },
            );
            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    self.log.record(
                        Actor::Planner,
                        scope_id.as_str(),
                        event::PLANNER_FAILED,
                        &json!({ "round": round, "error": err.to_string() }),
                    );
                    if scope_id.is_root() && matches!(err, PlannerError::Provider(_)) {
                        return Err(err.to_string());
                    }
                    warn!(scope = %scope_id, error = %err, "planner failed; recording handoff");
                    tree.mark_ran(&scope_id, round, seen, false);
                    phase
                        .failures
                        .push(Handoff::planner_failure(&scope_id, round, err.to_string()));
                    continue;
                }
            };

            self.log.record(
                Actor::Planner,
                scope_id.as_str(),
                event::PLANNER_OUTPUT,
                &json!({ "round": round, "output": output }),
            );
            tree.mark_ran(&scope_id, round, seen, output.is_empty());

            for (n, planned) in output.tasks.iter().enumerate() {
                let task = Task::new(
                    format!("r{round}-{scope_id}-{}", n + 1),
                    scope_id.clone(),
                    round,
                    planned.description.clone(),
                );
                self.log
                    .record(Actor::Controller, &task.id, event::TASK_CREATED, &task);
                phase.work.push(WorkItem {
                    task,
                    scope: scope.clone(),
                });
            }

            for delegation in &output.delegations {
                match tree.delegate(&scope_id, delegation, round) {
                    Ok(outcome) => {
                        let created = matches!(outcome, DelegationOutcome::Created(_));
                        self.log.record(
                            Actor::Planner,
                            scope_id.as_str(),
                            event::DELEGATION,
                            &json!({
                                "round": round,
                                "requested": delegation.scope,
                                "scope": outcome.scope(),
                                "created": created,
                            }),
                        );
                        if let DelegationOutcome::Created(child) = outcome {
                            debug!(parent = %scope_id, child = %child, "sub-planner created");
                            phase.new_scopes += 1;
                            worklist.push_back(child);
                        }
                    }
                    Err(err) => {
                        warn!(scope = %scope_id, error = %err, "delegation rejected");
                        phase.failures.push(Handoff::planner_failure(
                            &scope_id,
                            round,
                            format!("delegation '{}' rejected: {err}", delegation.scope),
                        ));
                    }
                }
            }
        }

        Ok(phase)
    }

    fn append_failures(&self, ledger: &mut HandoffLedger, failures: Vec<Handoff>) {
        for handoff in failures {
            self.log.record(
                Actor::Planner,
                handoff.scope().as_str(),
                event::HANDOFF,
                &handoff,
            );
            ledger.push(handoff);
        }
    }

    fn record(&self, kind: &str, payload: &serde_json::Value) {
        self.log.record(Actor::Controller, "controller", kind, payload);
    }
}
