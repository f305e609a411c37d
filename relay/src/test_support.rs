//! Test-only model backends, response builders and repository fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use crate::core::types::{ModelResponse, ToolInvocation};
use crate::io::model::{BackendError, ModelBackend, ModelRequest};

type Reply = Result<ModelResponse, BackendError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backoff sleeper that returns immediately.
pub fn no_sleep(_delay: Duration) {}

pub fn text(value: &str) -> ModelResponse {
    ModelResponse::Text {
        text: value.to_string(),
    }
}

pub fn tool_call(name: &str, arguments: Value) -> ModelResponse {
    ModelResponse::ToolCall(ToolInvocation {
        name: name.to_string(),
        arguments,
    })
}

/// A minimal final handoff document with the given status and summary.
pub fn handoff_text(status: &str, summary: &str) -> ModelResponse {
    text(&format!(
        "## Handoff\nstatus: {status}\n### Summary\n{summary}\n### Concerns\nnone"
    ))
}

/// Backend that replays queued replies per model name.
///
/// A model with an empty queue fails fatally, so an unexpected extra call
/// shows up as an advance or an exhausted chain instead of a hang.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<(String, ModelRequest)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, model: &str, reply: Reply) {
        lock(&self.replies)
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Number of attempts sent to `model`.
    pub fn calls_for(&self, model: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|(name, _)| name == model)
            .count()
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests)
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }
}

impl ModelBackend for ScriptedBackend {
    fn send(&self, request: &ModelRequest, model: &str) -> Result<ModelResponse, BackendError> {
        lock(&self.requests).push((model.to_string(), request.clone()));
        lock(&self.replies)
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(BackendError::Fatal(format!(
                    "no scripted response for model {model}"
                )))
            })
    }
}

/// Backend computing each reply from the request, for concurrent scenarios
/// where arrival order is not deterministic.
pub struct FnBackend<F> {
    reply: F,
    calls: AtomicUsize,
}

impl<F> FnBackend<F>
where
    F: Fn(&ModelRequest, &str) -> Reply + Send + Sync,
{
    pub fn new(reply: F) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> ModelBackend for FnBackend<F>
where
    F: Fn(&ModelRequest, &str) -> Reply + Send + Sync,
{
    fn send(&self, request: &ModelRequest, model: &str) -> Result<ModelResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(request, model)
    }
}

/// Temporary source repository with a few files.
pub struct TempRepo {
    dir: TempDir,
}

impl TempRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp repo");
        let repo = Self { dir };
        repo.write("README.md", "# demo\n");
        repo.write("src/lib.rs", "pub fn answer() -> u32 {\n    41\n}\n");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(path, contents).expect("write repo file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.join(rel)).expect("read repo file")
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}
