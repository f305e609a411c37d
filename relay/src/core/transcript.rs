//! Running transcript of one worker's tool loop.

use serde::{Deserialize, Serialize};

use crate::core::types::{ToolInvocation, ToolObservation};

/// Reminder appended when the model answers with free text instead of a
/// tool call or a final handoff document.
pub const HANDOFF_REMINDER: &str =
    "Reminder: call a tool, or finish with a document that starts with `## Handoff`.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TranscriptEntry {
    ModelText { iteration: u32, text: String },
    ToolCall {
        iteration: u32,
        invocation: ToolInvocation,
    },
    Observation {
        iteration: u32,
        observation: ToolObservation,
    },
}

impl TranscriptEntry {
    fn render(&self) -> String {
        match self {
            TranscriptEntry::ModelText { iteration, text } => {
                format!("[{iteration}] model:\n{}\n{HANDOFF_REMINDER}", text.trim())
            }
            TranscriptEntry::ToolCall {
                iteration,
                invocation,
            } => format!(
                "[{iteration}] tool_call {} {}",
                invocation.name, invocation.arguments
            ),
            TranscriptEntry::Observation {
                iteration,
                observation,
            } => match observation {
                ToolObservation::Ok { output } => {
                    format!("[{iteration}] observation ok:\n{output}")
                }
                ToolObservation::Error { kind, message } => {
                    let kind = serde_json::to_value(kind)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default();
                    format!("[{iteration}] observation error ({kind}): {message}")
                }
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the newest entries that fit in `budget` bytes, oldest first.
    ///
    /// A single entry larger than the budget is cut from the front so the
    /// most recent output survives.
    pub fn render_tail(&self, budget: usize) -> String {
        let mut kept: Vec<String> = Vec::new();
        let mut used = 0usize;
        for entry in self.entries.iter().rev() {
            let rendered = entry.render();
            let cost = rendered.len() + 2;
            if used + cost > budget {
                if kept.is_empty() {
                    kept.push(truncate_front(&rendered, budget));
                }
                break;
            }
            used += cost;
            kept.push(rendered);
        }
        kept.reverse();
        kept.join("\n\n")
    }
}

/// Keep at most `max_bytes` from the end of `text` on a char boundary.
pub fn truncate_front(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Keep at most `max_bytes` from the start of `text` on a char boundary.
pub fn truncate_back(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
