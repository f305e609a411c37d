//! I/O helpers: configuration, processes, model access, tools, persistence.

pub mod config;
pub mod gateway;
pub mod init;
pub mod model;
pub mod process;
pub mod prompt;
pub mod repo_copy;
pub mod result_store;
pub mod session_log;
pub mod tools;
