//! `result.json` for a finished session.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{Handoff, Scope, ScopeId, Task, TerminalState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    pub goal: String,
    pub terminal: TerminalState,
    pub rounds: u32,
    pub scopes: Vec<Scope>,
    pub tasks: Vec<Task>,
    pub handoffs: BTreeMap<ScopeId, Vec<Handoff>>,
}

/// Atomically write the session result (temp file + rename).
pub fn write_result(path: &Path, result: &SessionResult) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("result path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(result).context("serialize session result")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp result {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace result {}", path.display()))
}

pub fn load_result(path: &Path) -> Result<SessionResult> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
