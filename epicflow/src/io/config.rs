//! Engine configuration stored under `.epicflow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::loop_detector::LoopDetectionConfig;

pub const CONFIG_DIR: &str = ".epicflow";
pub const CONFIG_FILE: &str = "config.toml";
pub const HEADLESS_ENV: &str = "EPICFLOW_HEADLESS";
const LOGS_DIR: &str = "logs";
const STATE_GITIGNORE: &str = "logs/\n";

/// Engine configuration (TOML).
///
/// Resolved completely before a run starts; the engine never prompts.
/// Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock limit for a single agent invocation.
    pub step_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Skip the interactive confirmation in the CLI.
    pub headless: bool,

    pub agent: AgentConfig,
    pub loop_detection: LoopDetectionConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI and its fixed arguments; the instruction is written to stdin.
    pub command: Vec<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Branch to create or check out before the first step.
    pub branch: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "stream-json", "--verbose"]
                .map(str::to_string)
                .to_vec(),
            model: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            headless: false,
            agent: AgentConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(anyhow!("agent.model must not be blank when set"));
        }
        let detection = &self.loop_detection;
        if detection.threshold < 2 {
            return Err(anyhow!("loop_detection.threshold must be >= 2"));
        }
        if detection.window < detection.threshold {
            return Err(anyhow!(
                "loop_detection.window ({}) must be >= threshold ({})",
                detection.window,
                detection.threshold
            ));
        }
        if let Some(branch) = &self.git.branch
            && (branch.trim().is_empty() || branch.chars().any(char::is_whitespace))
        {
            return Err(anyhow!("git.branch must be a non-empty name without spaces"));
        }
        Ok(())
    }

    /// Apply environment overrides: `EPICFLOW_HEADLESS=1` or a set `CI`
    /// variable force headless mode.
    pub fn apply_env(&mut self) {
        let flag = std::env::var(HEADLESS_ENV).ok();
        let ci = std::env::var_os("CI").is_some();
        if headless_from_env(flag.as_deref(), ci) {
            self.headless = true;
        }
    }
}

fn headless_from_env(flag: Option<&str>, ci: bool) -> bool {
    match flag.map(str::trim) {
        Some("1" | "true" | "yes") => true,
        Some("0" | "false" | "no") => false,
        _ => ci,
    }
}

/// Default config location under a repository root.
pub fn default_config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Create `.epicflow/` with a `.gitignore` that keeps agent stream logs out of
/// step commits and out of reach of `git clean`. Returns the logs directory.
pub fn ensure_state_dir(repo_root: &Path) -> Result<PathBuf> {
    let state_dir = repo_root.join(CONFIG_DIR);
    let logs_dir = state_dir.join(LOGS_DIR);
    fs::create_dir_all(&logs_dir)
        .with_context(|| format!("create directory {}", logs_dir.display()))?;
    let gitignore = state_dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, STATE_GITIGNORE)
            .with_context(|| format!("write {}", gitignore.display()))?;
    }
    Ok(logs_dir)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.loop_detection.threshold, 3);
        assert_eq!(cfg.loop_detection.window, 10);
    }

    #[test]
    fn serialized_overrides_load_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = default_config_path(temp.path());
        let mut cfg = EngineConfig::default();
        cfg.agent.model = Some("sonnet".to_string());
        cfg.git.branch = Some("epic/checkout".to_string());
        cfg.loop_detection.threshold = 4;
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, toml::to_string_pretty(&cfg).expect("serialize")).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "step_timeout_secs = 30\n[loop_detection]\nthreshold = 5\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.step_timeout_secs, 30);
        assert_eq!(cfg.loop_detection.threshold, 5);
        assert!(cfg.loop_detection.enabled);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn rejects_bad_loop_detection_sizes() {
        let mut cfg = EngineConfig::default();
        cfg.loop_detection.threshold = 1;
        assert!(cfg.validate().is_err());

        cfg.loop_detection.threshold = 6;
        cfg.loop_detection.window = 5;
        let err = cfg.validate().expect_err("window < threshold");
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn rejects_empty_command_and_zero_timeout() {
        let mut cfg = EngineConfig::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.step_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn state_dir_ignores_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs = ensure_state_dir(temp.path()).expect("state dir");
        assert!(logs.is_dir());
        let gitignore = fs::read_to_string(temp.path().join(CONFIG_DIR).join(".gitignore"))
            .expect("gitignore");
        assert_eq!(gitignore, STATE_GITIGNORE);
    }

    #[test]
    fn headless_env_resolution() {
        assert!(headless_from_env(Some("1"), false));
        assert!(!headless_from_env(Some("0"), true));
        assert!(headless_from_env(None, true));
        assert!(!headless_from_env(None, false));
        assert!(!headless_from_env(Some("maybe"), false));
    }
}
