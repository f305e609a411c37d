//! Session-level tests: full `relay run` sessions against scripted models.
//!
//! Each test drives `run_session_with_backend` in a temporary repository with
//! the real tool executor, copy service and session log, then checks the
//! session outcome, `result.json` and the replayed `session.jsonl`.

use serde_json::json;

use relay::core::types::{
    Actor, AttemptOutcome, HandoffStatus, ModelResponse, ScopeId, TaskStatus, TerminalState,
};
use relay::io::config::RelayConfig;
use relay::io::model::{BackendError, ModelRequest};
use relay::io::result_store::load_result;
use relay::io::session_log::{event, read_session_log};
use relay::replay::replay_file;
use relay::session::run_session_with_backend;
use relay::test_support::{FnBackend, ScriptedBackend, TempRepo, handoff_text, text, tool_call};

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.model.primary = "primary".to_string();
    config.model.base_delay_secs = 0.0;
    config.model.max_delay_secs = 0.0;
    config
}

/// Planning round from the planner prompt's `- round: N of M` line.
fn planner_round(request: &ModelRequest) -> u32 {
    request
        .prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix("- round: "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Worker turn from the contract's `this is turn N.` sentence.
fn worker_turn(request: &ModelRequest) -> u32 {
    request
        .prompt
        .split("this is turn ")
        .nth(1)
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

fn plan(value: serde_json::Value) -> Result<ModelResponse, BackendError> {
    Ok(text(&value.to_string()))
}

fn single_task_backend(
    request: &ModelRequest,
    _model: &str,
) -> Result<ModelResponse, BackendError> {
    match request.actor {
        Actor::Planner if planner_round(request) == 1 => {
            plan(json!({ "tasks": [{ "description": "bump the answer" }] }))
        }
        Actor::Planner => plan(json!({ "tasks": [], "delegations": [] })),
        _ => Ok(handoff_text("done", "bumped the answer")),
    }
}

/// Scenario: one task that finishes on the worker's first turn.
///
/// With room for more rounds the second planning phase is empty, so the
/// session converges after one counted round.
#[test]
fn single_task_session_converges() {
    let repo = TempRepo::new();
    let backend = FnBackend::new(single_task_backend);

    let report = run_session_with_backend(repo.path(), &config(), "bump", Some(4), &backend)
        .expect("session");

    assert_eq!(report.outcome.terminal, TerminalState::Converged);
    assert_eq!(report.outcome.rounds, 1);
    assert_eq!(report.outcome.handoffs.len(), 1);
    assert_eq!(report.outcome.tasks[0].status, TaskStatus::Done);

    let result = load_result(&report.paths.result_path).expect("result.json");
    assert_eq!(result.terminal, TerminalState::Converged);
    assert_eq!(result.rounds, 1);
    assert_eq!(result.handoffs[&ScopeId::root()].len(), 1);
    assert_eq!(
        result.handoffs[&ScopeId::root()][0].summary(),
        "bumped the answer"
    );

    let replay = replay_file(&report.paths.log_path).expect("replay");
    assert_eq!(replay.terminal, Some(TerminalState::Converged));
    assert_eq!(replay.rounds, 1);
    assert_eq!(replay.handoffs, result.handoffs);
    assert_eq!(replay.records as u64, report.records);

    // Copies are discarded and the empty session copies dir is removed.
    assert!(
        !repo
            .join(".relay/copies")
            .join(&report.session_id)
            .exists()
    );
}

/// Scenario: the same single task with `max_rounds = 1` stops at the limit.
#[test]
fn single_round_session_reaches_limit() {
    let repo = TempRepo::new();
    let backend = FnBackend::new(single_task_backend);

    let report = run_session_with_backend(repo.path(), &config(), "bump", Some(1), &backend)
        .expect("session");

    assert_eq!(report.outcome.terminal, TerminalState::RoundLimitReached);
    assert_eq!(report.outcome.rounds, 1);
    assert_eq!(report.outcome.handoffs.len(), 1);
    assert_eq!(
        relay::exit_codes::for_terminal(&report.outcome.terminal),
        relay::exit_codes::ROUND_LIMIT
    );
}

/// Scenario: the primary and the first fallback are rate limited on every
/// retry; the second fallback answers.
///
/// The session log holds `max_retries` attempts for each of the first two
/// models followed by one success on the third, all under one call id.
#[test]
fn rate_limited_chain_falls_back_in_order() {
    let repo = TempRepo::new();
    let mut config = config();
    config.model.fallbacks = vec!["fb-1".to_string(), "fb-2".to_string()];
    config.model.max_retries = 3;

    let backend = ScriptedBackend::new();
    for model in ["primary", "fb-1"] {
        for _ in 0..3 {
            backend.push(model, Err(BackendError::RateLimited("429".to_string())));
        }
    }
    backend.push("fb-2", plan(json!({ "tasks": [] })));

    let report = run_session_with_backend(repo.path(), &config, "nothing to do", None, &backend)
        .expect("session");
    assert_eq!(report.outcome.terminal, TerminalState::Converged);
    assert_eq!(report.outcome.rounds, 0);

    let replay = replay_file(&report.paths.log_path).expect("replay");
    assert_eq!(replay.calls.len(), 1);
    let trace: Vec<(&str, AttemptOutcome)> = replay.calls[0]
        .attempts
        .iter()
        .map(|a| (a.model.as_str(), a.outcome))
        .collect();
    assert_eq!(
        trace,
        vec![
            ("primary", AttemptOutcome::RateLimited),
            ("primary", AttemptOutcome::RateLimited),
            ("primary", AttemptOutcome::RateLimited),
            ("fb-1", AttemptOutcome::RateLimited),
            ("fb-1", AttemptOutcome::RateLimited),
            ("fb-1", AttemptOutcome::RateLimited),
            ("fb-2", AttemptOutcome::Success),
        ]
    );
    assert_eq!(backend.calls_for("primary"), 3);
}

/// Scenario: the worker's first `edit_file` names text that is not in the
/// file. The conflict comes back as an observation, the loop continues and
/// the corrected edit lands in the worker's copy only.
#[test]
fn edit_conflict_is_observed_and_retried() {
    let repo = TempRepo::new();
    let mut config = config();
    config.workspace.retain_copies = true;

    let backend = FnBackend::new(|request: &ModelRequest, _model: &str| match request.actor {
        Actor::Planner if planner_round(request) == 1 => {
            plan(json!({ "tasks": [{ "description": "make answer return 42" }] }))
        }
        Actor::Planner => plan(json!({})),
        _ => match worker_turn(request) {
            1 => Ok(tool_call(
                "edit_file",
                json!({ "path": "src/lib.rs", "old": "    40\n", "new": "    42\n" }),
            )),
            2 => {
                assert!(
                    request.prompt.contains("observation error (conflict)"),
                    "conflict must reach the model"
                );
                Ok(tool_call(
                    "edit_file",
                    json!({ "path": "src/lib.rs", "old": "    41\n", "new": "    42\n" }),
                ))
            }
            _ => Ok(handoff_text("done", "answer is 42")),
        },
    });

    let report = run_session_with_backend(repo.path(), &config, "answer 42", Some(3), &backend)
        .expect("session");

    assert_eq!(report.outcome.terminal, TerminalState::Converged);
    let handoff = &report.outcome.handoffs.all()[0];
    assert_eq!(handoff.status(), HandoffStatus::Done);

    let copy = repo
        .join(".relay/copies")
        .join(&report.session_id)
        .join("r1-root-1/src/lib.rs");
    let edited = std::fs::read_to_string(copy).expect("retained copy");
    assert!(edited.contains("    42\n"));
    assert!(repo.read("src/lib.rs").contains("    41\n"), "source untouched");

    let records = read_session_log(&report.paths.log_path).expect("log");
    let observations: Vec<_> = records
        .iter()
        .filter(|r| r.kind == event::TOOL_OBSERVATION)
        .collect();
    assert_eq!(observations.len(), 2);
    assert_eq!(observations[0].payload["observation"]["status"], "error");
    assert_eq!(observations[0].payload["observation"]["kind"], "conflict");
    assert_eq!(observations[1].payload["observation"]["status"], "ok");
    // Each tool call is logged before its observation.
    let call_seq = records
        .iter()
        .find(|r| r.kind == event::TOOL_CALL)
        .map(|r| r.seq)
        .expect("tool call record");
    assert!(call_seq < observations[0].seq);
}

/// Scenario: the root delegates "auth" in round 1 and "Auth" again in
/// round 2. Only one sub-planner exists and it keeps its first description.
#[test]
fn repeated_delegation_reuses_sub_planner() {
    let repo = TempRepo::new();
    let backend = FnBackend::new(|request: &ModelRequest, _model: &str| {
        match (request.actor, request.actor_id.as_str()) {
            (Actor::Planner, "root") => match planner_round(request) {
                1 => plan(json!({
                    "delegations": [{ "scope": "auth", "description": "login flow" }]
                })),
                2 => plan(json!({
                    "tasks": [{ "description": "wire auth into main" }],
                    "delegations": [{ "scope": "Auth", "description": "second try" }]
                })),
                _ => plan(json!({})),
            },
            (Actor::Planner, _) => match planner_round(request) {
                1 => plan(json!({ "tasks": [{ "description": "add /login" }] })),
                _ => plan(json!({})),
            },
            _ => Ok(handoff_text("done", "ok")),
        }
    });

    let report = run_session_with_backend(repo.path(), &config(), "auth", Some(5), &backend)
        .expect("session");

    assert_eq!(report.outcome.terminal, TerminalState::Converged);
    assert_eq!(report.outcome.rounds, 2);
    let scopes: Vec<_> = report.outcome.tree.scopes().collect();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[1].id, ScopeId::new("auth"));
    assert_eq!(scopes[1].description, "login flow");
    assert_eq!(scopes[1].parent, Some(ScopeId::root()));

    let records = read_session_log(&report.paths.log_path).expect("log");
    let created: Vec<bool> = records
        .iter()
        .filter(|r| r.kind == event::DELEGATION)
        .map(|r| r.payload["created"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(created, vec![true, false]);

    let by_scope = report.outcome.handoffs_by_scope();
    assert_eq!(by_scope[&ScopeId::new("auth")].len(), 1);
    assert_eq!(by_scope[&ScopeId::root()].len(), 1);
}

/// Exhausting every model during the root planner call is fatal, but the
/// session still writes its result and log.
#[test]
fn root_exhaustion_is_fatal_and_persisted() {
    let repo = TempRepo::new();
    let backend = FnBackend::new(|_request: &ModelRequest, _model: &str| {
        Err(BackendError::Transient("503".to_string()))
    });

    let report = run_session_with_backend(repo.path(), &config(), "goal", None, &backend)
        .expect("session");

    match &report.outcome.terminal {
        TerminalState::FatalError { round, message } => {
            assert_eq!(*round, 1);
            assert!(message.contains("503"), "{message}");
        }
        other => panic!("unexpected terminal state {other:?}"),
    }
    assert_eq!(backend.calls(), 3);
    let result = load_result(&report.paths.result_path).expect("result.json");
    assert_eq!(result.terminal, report.outcome.terminal);
    let replay = replay_file(&report.paths.log_path).expect("replay");
    assert_eq!(replay.terminal, Some(report.outcome.terminal.clone()));
}
