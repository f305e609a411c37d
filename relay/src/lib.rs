//! Hierarchical agent orchestrator.
//!
//! A session turns a goal into rounds of planning and execution: a tree of
//! planners decomposes the goal into scoped tasks, a bounded pool of workers
//! runs each task through a tool loop inside its own repository copy, and every
//! model call goes through a gateway that retries and falls back across models.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (planner tree, handoff ledger,
//!   tool loop and fallback state machines). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, processes, model backend,
//!   tools, repository copies, session log). Isolated behind traits so tests
//!   can script them.
//! - **[`agents`]**: Planner and worker wrappers around the model gateway.
//!
//! Orchestration modules ([`round`], [`pool`], [`session`]) coordinate core
//! logic with I/O to implement `relay run`; [`replay`] rebuilds a session from
//! its log.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod replay;
pub mod round;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
