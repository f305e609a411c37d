//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod fallback;
pub mod handoff;
pub mod ledger;
pub mod plan;
pub mod planner_tree;
pub mod tool_loop;
pub mod transcript;
pub mod types;
