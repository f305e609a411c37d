//! Rebuild a session summary from its JSONL log alone.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::core::types::{Handoff, ModelAttempt, ScopeId, TerminalState};
use crate::io::session_log::{SessionRecord, event, read_session_log};

/// Every attempt of one logical model call, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTrace {
    pub call_id: String,
    /// Planner scope or task id that issued the call.
    pub actor_id: String,
    pub attempts: Vec<ModelAttempt>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub session_id: Option<String>,
    pub goal: Option<String>,
    /// `None` when the session never finished (crash or still running).
    pub terminal: Option<TerminalState>,
    pub rounds: u32,
    pub handoffs: BTreeMap<ScopeId, Vec<Handoff>>,
    /// Calls in order of their first attempt.
    pub calls: Vec<CallTrace>,
    pub records: usize,
}

#[derive(Debug, Deserialize)]
struct SessionStarted {
    session_id: String,
    goal: String,
}

#[derive(Debug, Deserialize)]
struct SessionFinished {
    terminal: TerminalState,
    rounds: u32,
}

pub fn replay_file(path: &Path) -> Result<ReplaySummary> {
    let records = read_session_log(path)?;
    replay_records(&records).with_context(|| format!("replay {}", path.display()))
}

/// Fold session records into a summary. Records of unknown types are skipped.
pub fn replay_records(records: &[SessionRecord]) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary {
        records: records.len(),
        ..ReplaySummary::default()
    };
    let mut rounds_finished = 0u32;

    for record in records {
        match record.kind.as_str() {
            event::SESSION_STARTED => {
                let started: SessionStarted = payload(record)?;
                summary.session_id = Some(started.session_id);
                summary.goal = Some(started.goal);
            }
            event::SESSION_FINISHED => {
                let finished: SessionFinished = payload(record)?;
                summary.terminal = Some(finished.terminal);
                summary.rounds = finished.rounds;
            }
            event::ROUND_FINISHED => rounds_finished += 1,
            event::HANDOFF => {
                let handoff: Handoff = payload(record)?;
                summary
                    .handoffs
                    .entry(handoff.scope().clone())
                    .or_default()
                    .push(handoff);
            }
            event::MODEL_ATTEMPT => {
                let attempt: ModelAttempt = payload(record)?;
                match summary
                    .calls
                    .iter_mut()
                    .find(|call| call.call_id == attempt.call_id)
                {
                    Some(call) => call.attempts.push(attempt),
                    None => summary.calls.push(CallTrace {
                        call_id: attempt.call_id.clone(),
                        actor_id: record.actor_id.clone(),
                        attempts: vec![attempt],
                    }),
                }
            }
            _ => {}
        }
    }

    if summary.terminal.is_none() {
        summary.rounds = rounds_finished;
    } else if summary.rounds != rounds_finished {
        warn!(
            logged = summary.rounds,
            counted = rounds_finished,
            "round count mismatch in session log"
        );
    }
    Ok(summary)
}

fn payload<T: DeserializeOwned>(record: &SessionRecord) -> Result<T> {
    serde_json::from_value(record.payload.clone())
        .with_context(|| format!("record {} ({}) has an invalid payload", record.seq, record.kind))
}
