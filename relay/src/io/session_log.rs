//! Append-only JSONL session log under `.relay/sessions/<id>/session.jsonl`.
//!
//! Components hold cheap [`SessionLogger`] handles and send records over an
//! mpsc channel; a single writer thread owns the file, assigns sequence
//! numbers and writes one complete line per record. Concurrent workers can
//! therefore never interleave bytes within a line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::Actor;

/// Record `type` values written by the engine.
pub mod event {
    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_FINISHED: &str = "session_finished";
    pub const ROUND_STARTED: &str = "round_started";
    pub const ROUND_FINISHED: &str = "round_finished";
    pub const PLANNER_OUTPUT: &str = "planner_output";
    pub const PLANNER_FAILED: &str = "planner_failed";
    pub const DELEGATION: &str = "delegation";
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_STATUS: &str = "task_status";
    pub const MODEL_REQUEST: &str = "model_request";
    pub const MODEL_ATTEMPT: &str = "model_attempt";
    pub const MODEL_RESPONSE: &str = "model_response";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_OBSERVATION: &str = "tool_observation";
    pub const HANDOFF: &str = "handoff";
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Writer-assigned, strictly increasing from 0.
    pub seq: u64,
    /// RFC 3339 timestamp taken by the writer, non-decreasing with `seq`.
    pub ts: String,
    pub actor: Actor,
    pub actor_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

struct PendingRecord {
    actor: Actor,
    actor_id: String,
    kind: String,
    payload: Value,
}

enum Message {
    Record(PendingRecord),
    Shutdown,
}

/// Owner of the writer thread for one session log file.
pub struct SessionLog {
    path: PathBuf,
    sender: Sender<Message>,
    writer: Option<JoinHandle<Result<u64>>>,
}

impl SessionLog {
    /// Create the log file (and its parent directory) and start the writer.
    ///
    /// Fails if the file already exists: a session log is never reopened.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create session dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create session log {}", path.display()))?;

        let (sender, receiver) = mpsc::channel();
        let writer = thread::Builder::new()
            .name("relay-session-log".to_string())
            .spawn(move || write_records(file, &receiver))
            .context("spawn session log writer")?;
        debug!(path = %path.display(), "session log opened");

        Ok(Self {
            path: path.to_path_buf(),
            sender,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logger(&self) -> SessionLogger {
        SessionLogger {
            sender: Some(self.sender.clone()),
        }
    }

    /// Drain pending records, stop the writer and return the record count.
    ///
    /// Records sent after this call are dropped.
    pub fn finish(mut self) -> Result<u64> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64> {
        let Some(writer) = self.writer.take() else {
            return Ok(0);
        };
        // The writer only exits after a shutdown message or a write error.
        let _ = self.sender.send(Message::Shutdown);
        match writer.join() {
            Ok(result) => result.with_context(|| format!("write {}", self.path.display())),
            Err(_) => Err(anyhow!("session log writer thread panicked")),
        }
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("session log did not shut down cleanly: {err:#}");
        }
    }
}

/// Cloneable handle used by every component to append records.
#[derive(Debug, Clone, Default)]
pub struct SessionLogger {
    sender: Option<Sender<Message>>,
}

impl SessionLogger {
    /// Logger that discards every record.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record<T: Serialize>(&self, actor: Actor, actor_id: &str, kind: &str, payload: &T) {
        let Some(sender) = &self.sender else {
            return;
        };
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(kind, err = %err, "session record payload not serializable");
                Value::String(format!("unserializable payload: {err}"))
            }
        };
        let pending = PendingRecord {
            actor,
            actor_id: actor_id.to_string(),
            kind: kind.to_string(),
            payload,
        };
        if sender.send(Message::Record(pending)).is_err() {
            debug!(kind, "session log closed, record dropped");
        }
    }
}

fn write_records(file: File, receiver: &Receiver<Message>) -> Result<u64> {
    let mut out = BufWriter::new(file);
    let mut seq = 0u64;
    for message in receiver {
        let pending = match message {
            Message::Record(pending) => pending,
            Message::Shutdown => break,
        };
        let record = SessionRecord {
            seq,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            actor: pending.actor,
            actor_id: pending.actor_id,
            kind: pending.kind,
            payload: pending.payload,
        };
        serde_json::to_writer(&mut out, &record).context("serialize session record")?;
        out.write_all(b"\n").context("write session record")?;
        out.flush().context("flush session log")?;
        seq += 1;
    }
    out.flush().context("flush session log")?;
    Ok(seq)
}

/// Read every record of a session log, in file order.
pub fn read_session_log(path: &Path) -> Result<Vec<SessionRecord>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SessionRecord = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_sequenced_and_complete_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("s1/session.jsonl");
        let log = SessionLog::create(&path).expect("create");
        let logger = log.logger();
        logger.record(
            Actor::Controller,
            "controller",
            event::SESSION_STARTED,
            &json!({"goal": "g"}),
        );
        logger.record(
            Actor::Worker,
            "r1-root-1",
            event::TOOL_CALL,
            &json!({"name": "run_cmd"}),
        );
        assert_eq!(log.finish().expect("finish"), 2);

        let records = read_session_log(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].seq, 1);
        assert_eq!(records[1].actor, Actor::Worker);
        assert_eq!(records[1].kind, "tool_call");
        assert!(chrono::DateTime::parse_from_rfc3339(&records[0].ts).is_ok());
    }

    /// Many threads writing at once still produce one parseable record per
    /// line, in sequence order, with timestamps that agree with it.
    #[test]
    fn concurrent_writers_never_interleave() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.jsonl");
        let log = SessionLog::create(&path).expect("create");

        thread::scope(|scope| {
            for worker in 0..8 {
                let logger = log.logger();
                scope.spawn(move || {
                    for i in 0..50 {
                        logger.record(
                            Actor::Worker,
                            &format!("w{worker}"),
                            event::TOOL_OBSERVATION,
                            &json!({"i": i, "output": "x".repeat(512)}),
                        );
                    }
                });
            }
        });
        assert_eq!(log.finish().expect("finish"), 400);

        let records = read_session_log(&path).expect("read");
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (0..400).collect::<Vec<_>>());
        let stamps: Vec<_> = records
            .iter()
            .map(|r| chrono::DateTime::parse_from_rfc3339(&r.ts).expect("ts"))
            .collect();
        assert!(
            stamps.windows(2).all(|pair| pair[0] <= pair[1]),
            "timestamps must follow sequence order"
        );
    }

    #[test]
    fn refuses_to_reopen_existing_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.jsonl");
        fs::write(&path, "").expect("write");
        assert!(SessionLog::create(&path).is_err());
    }

    #[test]
    fn disabled_logger_is_a_no_op() {
        SessionLogger::disabled().record(
            Actor::Gateway,
            "call-1",
            event::MODEL_ATTEMPT,
            &json!({}),
        );
    }
}
