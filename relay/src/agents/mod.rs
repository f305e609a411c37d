//! Agent wrappers around the model gateway.
//!
//! Planners decompose a scope into tasks and sub-scopes without touching the
//! repository; workers run the tool loop inside a repository copy.

pub mod planner;
pub mod worker;
