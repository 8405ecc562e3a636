//! Supervisor process configuration stored in `shepherd.toml`.
//!
//! Durable scheduler knobs (lease TTL, attempt caps, verify policy) live in
//! `Task.json` so they travel with the task file; this file holds settings
//! that only concern the local supervisor process.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Supervisor configuration (TOML). Missing fields default to working values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker command; `--task-id` / `--run-id` arguments are appended.
    pub worker_command: Vec<String>,

    /// Turn budget passed through to the worker (`--max-turns N`); 0 omits it.
    pub max_turns: u32,

    /// Wall-clock budget for one worker invocation, in seconds.
    pub worker_timeout_secs: u64,

    /// Verification command run through `sh -c`.
    pub verify_command: String,

    /// Wall-clock budget for the verify script, in seconds.
    pub verify_timeout_secs: u64,

    /// Delay between loop iterations, in seconds.
    pub loop_delay_secs: u64,

    /// Bound on worker stdout/stderr kept in memory, in bytes.
    pub worker_output_limit_bytes: usize,

    /// Bound on verify output kept in memory, in bytes.
    pub verify_output_limit_bytes: usize,

    /// Optional override for the embedded worker prompt template.
    pub prompt_template: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            max_turns: 50,
            worker_timeout_secs: 900,
            verify_command: "scripts/verify.sh".to_string(),
            verify_timeout_secs: 300,
            loop_delay_secs: 3,
            worker_output_limit_bytes: 1_000_000,
            verify_output_limit_bytes: 1_000_000,
            prompt_template: None,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_command.is_empty() || self.worker_command[0].trim().is_empty() {
            return Err(anyhow!("worker_command must be a non-empty array"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(anyhow!("worker_timeout_secs must be > 0"));
        }
        if self.verify_command.trim().is_empty() {
            return Err(anyhow!("verify_command must be non-empty"));
        }
        if self.worker_output_limit_bytes == 0 {
            return Err(anyhow!("worker_output_limit_bytes must be > 0"));
        }
        if self.verify_output_limit_bytes == 0 {
            return Err(anyhow!("verify_output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file. Missing file returns defaults.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SupervisorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shepherd.toml");
        let cfg = SupervisorConfig {
            worker_timeout_secs: 120,
            ..SupervisorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn empty_worker_command_is_rejected() {
        let cfg = SupervisorConfig {
            worker_command: Vec::new(),
            ..SupervisorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
