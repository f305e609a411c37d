//! Relay configuration stored under `.relay/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::Backoff;
use crate::core::tool_loop::MAX_ITERATIONS;

/// Longest a single `run_cmd` may run, whatever the model asks for.
pub const MAX_TOOL_TIMEOUT_SECS: u64 = 300;

/// Relay configuration (TOML).
///
/// Edited by humans; missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Round budget for a session when `--max-rounds` is not given.
    pub max_rounds: u32,

    /// Upper bound on concurrently running workers.
    pub max_workers: usize,

    /// Model calls allowed per task before the handoff is marked incomplete.
    pub max_iterations: u32,

    /// Byte budget for a rendered planner or worker prompt.
    pub prompt_budget_bytes: usize,

    pub model: ModelConfig,
    pub backend: BackendConfig,
    pub tools: ToolsConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub primary: String,
    /// Tried in order once the primary is exhausted.
    pub fallbacks: Vec<String>,
    /// Attempts per model before moving to the next one.
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl ModelConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::from_secs_f64(self.base_delay_secs, self.max_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Command spawned once per model attempt (e.g. `["relay-model"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    /// `run_cmd` timeout when the model does not pass one.
    pub default_timeout_secs: u64,
    /// Truncate tool output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl ToolsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Where worker repository copies are created, relative to the repo root.
    pub copies_dir: String,
    /// Keep worker copies after completion for inspection.
    pub retain_copies: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_workers: 4,
            max_iterations: MAX_ITERATIONS,
            prompt_budget_bytes: 60_000,
            model: ModelConfig::default(),
            backend: BackendConfig::default(),
            tools: ToolsConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: "primary-model".to_string(),
            fallbacks: Vec::new(),
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["relay-model".to_string()],
            timeout_secs: 600,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            copies_dir: ".relay/copies".to_string(),
            retain_copies: false,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(anyhow!("max_rounds must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.max_iterations == 0 || self.max_iterations > MAX_ITERATIONS {
            return Err(anyhow!("max_iterations must be in 1..={MAX_ITERATIONS}"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.model.primary.trim().is_empty() {
            return Err(anyhow!("model.primary must be non-empty"));
        }
        if self.model.fallbacks.iter().any(|m| m.trim().is_empty()) {
            return Err(anyhow!("model.fallbacks must not contain empty model ids"));
        }
        if self.model.max_retries == 0 {
            return Err(anyhow!("model.max_retries must be > 0"));
        }
        if !(self.model.base_delay_secs.is_finite() && self.model.base_delay_secs >= 0.0) {
            return Err(anyhow!("model.base_delay_secs must be a non-negative number"));
        }
        if !(self.model.max_delay_secs.is_finite()
            && self.model.max_delay_secs >= self.model.base_delay_secs)
        {
            return Err(anyhow!("model.max_delay_secs must be >= model.base_delay_secs"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        if self.backend.timeout_secs == 0 {
            return Err(anyhow!("backend.timeout_secs must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        if self.tools.default_timeout_secs == 0
            || self.tools.default_timeout_secs > MAX_TOOL_TIMEOUT_SECS
        {
            return Err(anyhow!(
                "tools.default_timeout_secs must be in 1..={MAX_TOOL_TIMEOUT_SECS}"
            ));
        }
        if self.tools.output_limit_bytes == 0 {
            return Err(anyhow!("tools.output_limit_bytes must be > 0"));
        }
        if self.workspace.copies_dir.trim().is_empty() {
            return Err(anyhow!("workspace.copies_dir must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RelayConfig::default()`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        let cfg = RelayConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
