//! Stable exit codes for relay CLI commands.

use crate::core::types::TerminalState;

/// Command succeeded; `relay run` converged.
pub const OK: i32 = 0;
/// Invalid config, goal or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `relay run` stopped at the round limit before converging.
pub const ROUND_LIMIT: i32 = 2;
/// The root planner's model chain was exhausted.
pub const FATAL: i32 = 3;

/// Exit code reported for a session's terminal state.
pub fn for_terminal(terminal: &TerminalState) -> i32 {
    match terminal {
        TerminalState::Converged => OK,
        TerminalState::RoundLimitReached => ROUND_LIMIT,
        TerminalState::FatalError { .. } => FATAL,
    }
}
