//! Initialization helpers and canonical paths for `.relay/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RelayConfig, write_config};

/// All canonical paths within `.relay/` for a project root.
#[derive(Debug, Clone)]
pub struct RelayPaths {
    pub root: PathBuf,
    pub relay_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub sessions_dir: PathBuf,
}

impl RelayPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let relay_dir = root.join(".relay");
        Self {
            root: root.clone(),
            relay_dir: relay_dir.clone(),
            config_path: relay_dir.join("config.toml"),
            gitignore_path: relay_dir.join(".gitignore"),
            sessions_dir: relay_dir.join("sessions"),
        }
    }

    pub fn session(&self, session_id: &str) -> SessionPaths {
        let dir = self.sessions_dir.join(session_id);
        SessionPaths {
            log_path: dir.join("session.jsonl"),
            result_path: dir.join("result.json"),
            dir,
        }
    }

    /// Worker copies for one session, under the configured copies dir.
    pub fn copies_for(&self, config: &RelayConfig, session_id: &str) -> PathBuf {
        self.root
            .join(&config.workspace.copies_dir)
            .join(session_id)
    }
}

/// Files of one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub result_path: PathBuf,
}

/// Options for `init_relay`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing relay-owned files.
    pub force: bool,
}

/// Create `.relay/` scaffolding in `root`.
///
/// Fails if `.relay/config.toml` already exists unless `options.force` is set.
pub fn init_relay(root: &Path, options: &InitOptions) -> Result<RelayPaths> {
    let paths = RelayPaths::new(root);
    if paths.relay_dir.exists() && !paths.relay_dir.is_dir() {
        return Err(anyhow!("relay init: .relay exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "relay init: .relay/config.toml already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.sessions_dir)
        .with_context(|| format!("create directory {}", paths.sessions_dir.display()))?;
    write_config(&paths.config_path, &RelayConfig::default())?;
    fs::write(&paths.gitignore_path, RELAY_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

const RELAY_GITIGNORE: &str = "sessions/\ncopies/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    /// Verifies init_relay creates the directory layout and a loadable config.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_relay(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.relay_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            RELAY_GITIGNORE
        );
        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }

    /// Verifies init_relay refuses to overwrite without --force, and restores
    /// defaults with it.
    #[test]
    fn init_respects_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_relay(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_workers = 9\n").expect("customize");

        let err = init_relay(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        init_relay(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(
            load_config(&paths.config_path).expect("load").max_workers,
            4
        );
    }

    #[test]
    fn session_paths_are_stable() {
        let paths = RelayPaths::new("/repo");
        let session = paths.session("20260101T000000Z-abc123");
        assert!(
            session
                .log_path
                .ends_with(".relay/sessions/20260101T000000Z-abc123/session.jsonl")
        );
        assert!(session.result_path.ends_with("result.json"));
        assert_eq!(
            paths.copies_for(&RelayConfig::default(), "s1"),
            Path::new("/repo/.relay/copies/s1")
        );
    }
}
