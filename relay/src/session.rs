//! Orchestration for one `relay run` session.
//!
//! A session owns a fresh directory under `.relay/sessions/<session-id>/`
//! holding the append-only `session.jsonl` and the final `result.json`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde_json::json;
use tracing::{debug, info};

use crate::core::types::Actor;
use crate::io::config::RelayConfig;
use crate::io::gateway::{GatewayPolicy, ModelGateway};
use crate::io::init::{RelayPaths, SessionPaths};
use crate::io::model::{CommandBackend, ModelBackend};
use crate::io::repo_copy::{DirCopyService, remove_if_empty};
use crate::io::result_store::{SessionResult, write_result};
use crate::io::session_log::{SessionLog, event};
use crate::io::tools::LocalToolExecutor;
use crate::round::{RoundController, RoundSettings, SessionOutcome};

/// Outcome of `relay run`.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub paths: SessionPaths,
    pub outcome: SessionOutcome,
    /// Records written to the session log.
    pub records: u64,
}

/// Run a session in `root` with the configured command backend.
pub fn run_session(
    root: &Path,
    config: &RelayConfig,
    goal: &str,
    max_rounds: Option<u32>,
) -> Result<SessionReport> {
    let backend = CommandBackend::new(
        config.backend.command.clone(),
        Duration::from_secs(config.backend.timeout_secs),
        config.backend.output_limit_bytes,
    );
    run_session_with_backend(root, config, goal, max_rounds, backend)
}

/// Run a session in `root` against an arbitrary model backend.
pub fn run_session_with_backend<B: ModelBackend>(
    root: &Path,
    config: &RelayConfig,
    goal: &str,
    max_rounds: Option<u32>,
    backend: B,
) -> Result<SessionReport> {
    config.validate().context("invalid relay config")?;
    let goal = goal.trim();
    if goal.is_empty() {
        return Err(anyhow!("goal must not be empty"));
    }
    let max_rounds = max_rounds.unwrap_or(config.max_rounds);
    if max_rounds == 0 {
        return Err(anyhow!("max rounds must be > 0"));
    }

    let relay_paths = RelayPaths::new(root);
    let session_id = generate_session_id();
    let paths = relay_paths.session(&session_id);
    let log = SessionLog::create(&paths.log_path)?;
    let logger = log.logger();
    info!(session = %session_id, max_rounds, "session started");
    logger.record(
        Actor::Controller,
        "controller",
        event::SESSION_STARTED,
        &json!({
            "session_id": session_id,
            "goal": goal,
            "max_rounds": max_rounds,
            "primary": config.model.primary,
            "fallbacks": config.model.fallbacks,
            "max_workers": config.max_workers,
        }),
    );

    let copies_dir = relay_paths.copies_for(config, &session_id);
    let copies = DirCopyService::new(root, &copies_dir, config.workspace.retain_copies);
    let gateway = ModelGateway::new(
        backend,
        GatewayPolicy::from_config(&config.model),
        logger.clone(),
    );
    let tools = LocalToolExecutor::new(&config.tools);
    let outcome = RoundController::new(
        &gateway,
        &tools,
        &copies,
        logger.clone(),
        RoundSettings::from_config(config),
    )
    .run(goal, max_rounds);

    let result = SessionResult {
        session_id: session_id.clone(),
        goal: goal.to_string(),
        terminal: outcome.terminal.clone(),
        rounds: outcome.rounds,
        scopes: outcome.tree.scopes().cloned().collect(),
        tasks: outcome.tasks.clone(),
        handoffs: outcome.handoffs_by_scope(),
    };
    write_result(&paths.result_path, &result)?;

    logger.record(
        Actor::Controller,
        "controller",
        event::SESSION_FINISHED,
        &json!({
            "terminal": outcome.terminal,
            "rounds": outcome.rounds,
            "handoffs": outcome.handoffs.len(),
        }),
    );
    drop(logger);
    let records = log.finish()?;
    if !config.workspace.retain_copies {
        remove_if_empty(&copies_dir);
    }
    debug!(records, log = %paths.log_path.display(), "session log closed");
    info!(
        session = %session_id,
        terminal = outcome.terminal.label(),
        rounds = outcome.rounds,
        "session finished"
    );

    Ok(SessionReport {
        session_id,
        paths,
        outcome,
        records,
    })
}

/// `<UTC timestamp>-<6 lowercase alphanumerics>`, sortable by start time.
pub fn generate_session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{timestamp}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_timestamped_and_distinct() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), "20260101T000000Z-abcdef".len());
        assert!(a.as_bytes()[8] == b'T' && a.as_bytes()[15] == b'Z');
        assert_ne!(a, b);
    }

    #[test]
    fn empty_goal_is_rejected_before_any_file_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = crate::test_support::ScriptedBackend::new();
        let err = run_session_with_backend(
            temp.path(),
            &RelayConfig::default(),
            "   ",
            None,
            &backend,
        )
        .unwrap_err();
        assert!(err.to_string().contains("goal must not be empty"));
        assert!(!temp.path().join(".relay").exists());
    }
}
