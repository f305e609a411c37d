//! Hierarchical agent orchestrator CLI.
//!
//! `relay run` drives a goal through rounds of planners and workers inside the
//! current repository and records everything under `.relay/sessions/`.

use std::collections::BTreeMap;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use relay::core::types::{Handoff, ScopeId, TerminalState};
use relay::exit_codes;
use relay::io::config::load_config;
use relay::io::init::{InitOptions, RelayPaths, init_relay};
use relay::replay::replay_file;
use relay::session::run_session;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Hierarchical planner/worker agent orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.relay/config.toml` and `.relay/.gitignore`.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a session for a goal in the current directory.
    #[command(group(ArgGroup::new("goal_source").required(true).args(["goal", "goal_file"])))]
    Run {
        /// Goal text.
        #[arg(long)]
        goal: Option<String>,
        /// Read the goal from a file.
        #[arg(long)]
        goal_file: Option<PathBuf>,
        /// Override `max_rounds` from the config.
        #[arg(long)]
        max_rounds: Option<u32>,
        /// Config file (default: `.relay/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Rebuild a session summary from its `session.jsonl`.
    Replay {
        /// Path to a session log.
        log: PathBuf,
    },
}

fn main() {
    relay::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            goal,
            goal_file,
            max_rounds,
            config,
        } => cmd_run(goal, goal_file, max_rounds, config),
        Command::Replay { log } => cmd_replay(log),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let root = env::current_dir().context("resolve current directory")?;
    let paths = init_relay(&root, &InitOptions { force })?;
    println!("initialized {}", paths.relay_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    goal: Option<String>,
    goal_file: Option<PathBuf>,
    max_rounds: Option<u32>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let root = env::current_dir().context("resolve current directory")?;
    let config_path = config.unwrap_or_else(|| RelayPaths::new(&root).config_path);
    let config = load_config(&config_path)?;
    let goal = match goal {
        Some(goal) => goal,
        None => {
            let path = goal_file.context("--goal or --goal-file is required")?;
            fs::read_to_string(&path)
                .with_context(|| format!("read goal file {}", path.display()))?
        }
    };

    let report = run_session(&root, &config, &goal, max_rounds)?;
    let handoffs = report.outcome.handoffs_by_scope();
    print!(
        "{}",
        render_summary(
            Some(&report.session_id),
            Some(&report.outcome.terminal),
            report.outcome.rounds,
            &handoffs,
        )
    );
    println!("log: {}", report.paths.log_path.display());
    println!("result: {}", report.paths.result_path.display());
    Ok(exit_codes::for_terminal(&report.outcome.terminal))
}

fn cmd_replay(log: PathBuf) -> Result<i32> {
    let summary = replay_file(&log)?;
    print!(
        "{}",
        render_summary(
            summary.session_id.as_deref(),
            summary.terminal.as_ref(),
            summary.rounds,
            &summary.handoffs,
        )
    );
    let attempts: usize = summary.calls.iter().map(|call| call.attempts.len()).sum();
    println!("model calls: {} ({attempts} attempts)", summary.calls.len());
    for call in summary.calls.iter().filter(|call| call.attempts.len() > 1) {
        let trace: Vec<String> = call
            .attempts
            .iter()
            .map(|a| format!("{}#{}:{:?}", a.model, a.attempt, a.outcome))
            .collect();
        println!("  {} ({}): {}", call.call_id, call.actor_id, trace.join(" -> "));
    }
    Ok(summary
        .terminal
        .as_ref()
        .map_or(exit_codes::OK, exit_codes::for_terminal))
}

/// Plain-text session summary shared by `run` and `replay`.
fn render_summary(
    session_id: Option<&str>,
    terminal: Option<&TerminalState>,
    rounds: u32,
    handoffs: &BTreeMap<ScopeId, Vec<Handoff>>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "session: {}", session_id.unwrap_or("unknown"));
    match terminal {
        Some(TerminalState::FatalError { round, message }) => {
            let _ = writeln!(out, "terminal: fatal-error (round {round}): {message}");
        }
        Some(state) => {
            let _ = writeln!(out, "terminal: {}", state.label());
        }
        None => {
            let _ = writeln!(out, "terminal: unfinished");
        }
    }
    let _ = writeln!(out, "rounds: {rounds}");
    let _ = writeln!(out, "handoffs:");
    for (scope, list) in handoffs {
        let _ = writeln!(out, "  {scope}:");
        for handoff in list {
            let producer = handoff.task_id().unwrap_or("planner");
            let summary = handoff.summary().lines().next().unwrap_or_default();
            let _ = writeln!(
                out,
                "    - [{}] {producer}: {summary}",
                handoff.status().as_str()
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay::core::types::{HandoffStatus, Task};

    #[test]
    fn run_requires_a_goal_source() {
        assert!(Cli::try_parse_from(["relay", "run"]).is_err());
        let both = ["relay", "run", "--goal", "a", "--goal-file", "g.md"];
        assert!(Cli::try_parse_from(both).is_err());
        let cli = Cli::try_parse_from(["relay", "run", "--goal", "ship", "--max-rounds", "3"])
            .expect("parse");
        match cli.command {
            Command::Run {
                goal, max_rounds, ..
            } => {
                assert_eq!(goal.as_deref(), Some("ship"));
                assert_eq!(max_rounds, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn summary_lists_handoffs_per_scope() {
        let task = Task::new("r1-root-1", ScopeId::root(), 1, "do it");
        let mut handoffs = BTreeMap::new();
        handoffs.insert(
            ScopeId::root(),
            vec![
                Handoff::from_worker(
                    &task,
                    HandoffStatus::Done,
                    "added route\nmore",
                    "",
                    Vec::new(),
                ),
                Handoff::planner_failure(&ScopeId::root(), 1, "bad json"),
            ],
        );
        let out = render_summary(
            Some("s1"),
            Some(&TerminalState::RoundLimitReached),
            2,
            &handoffs,
        );
        assert!(out.contains("terminal: round-limit-reached"));
        assert!(out.contains("    - [done] r1-root-1: added route\n"));
        assert!(out.contains("    - [failed] planner: planner for scope 'root'"));
    }
}
