//! Recognition and parsing of a worker's final handoff document.
//!
//! A final document starts with the `## Handoff` header. Everything else a
//! model says is treated as intermediate text. The document body is loosely
//! structured markdown:
//!
//! ```text
//! ## Handoff
//! Status: done
//! ### Summary
//! Added the login endpoint.
//! ### Notes
//! Tests live in tests/login.rs.
//! ### Concerns
//! - rate limiting is not covered
//! ```
//!
//! `Status:` is optional (defaults to done). Without any `###` section the
//! whole body becomes the summary.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::HandoffStatus;

pub const HANDOFF_HEADER: &str = "## Handoff";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^###\s+(summary|notes|concerns)[ \t]*$").expect("section regex is valid")
});

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^status:[ \t]*(\w+)[ \t]*$").expect("status regex is valid")
});

/// Handoff content as written by the model, before it is bound to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffDraft {
    pub status: HandoffStatus,
    pub summary: String,
    pub notes: String,
    pub concerns: Vec<String>,
}

/// Whether `text` is a final handoff document.
pub fn is_handoff(text: &str) -> bool {
    text.trim_start().starts_with(HANDOFF_HEADER)
}

/// Parse a final handoff document; `None` when `text` lacks the header.
pub fn parse_handoff(text: &str) -> Option<HandoffDraft> {
    if !is_handoff(text) {
        return None;
    }
    let body = &text.trim_start()[HANDOFF_HEADER.len()..];

    let status = STATUS_RE
        .captures(body)
        .and_then(|caps| parse_status(&caps[1]))
        .unwrap_or(HandoffStatus::Done);

    let headers: Vec<_> = SECTION_RE.captures_iter(body).collect();
    if headers.is_empty() {
        return Some(HandoffDraft {
            status,
            summary: strip_status_line(body).trim().to_string(),
            notes: String::new(),
            concerns: Vec::new(),
        });
    }

    let mut summary = String::new();
    let mut notes = String::new();
    let mut concerns = Vec::new();
    for (idx, caps) in headers.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let end = headers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(body.len(), |m| m.start());
        let content = body[whole.end()..end].trim();
        match caps[1].to_ascii_lowercase().as_str() {
            "summary" => summary = content.to_string(),
            "notes" => notes = content.to_string(),
            _ => concerns = parse_concerns(content),
        }
    }

    Some(HandoffDraft {
        status,
        summary,
        notes,
        concerns,
    })
}

fn parse_status(raw: &str) -> Option<HandoffStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "done" | "complete" | "completed" => Some(HandoffStatus::Done),
        "failed" | "failure" => Some(HandoffStatus::Failed),
        "incomplete" | "partial" => Some(HandoffStatus::Incomplete),
        _ => None,
    }
}

fn strip_status_line(body: &str) -> String {
    STATUS_RE.replace(body, "").into_owned()
}

fn parse_concerns(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*']).trim())
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect()
}
