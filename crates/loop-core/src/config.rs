//! Configuration for the orchestrator daemon.
//!
//! Parses the `key=value` file format the daemon accepts (scheduler/
//! worker/merge-queue option groups). Loading the file from disk and
//! layering it under CLI flags is an external concern; this module only
//! owns the shape and the parser.

use crate::types::MergeStrategy;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Daemon and run configuration, covering the scheduler, worker, and
/// merge-queue option groups.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Paths
    pub specs_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub db_path: PathBuf,
    pub pid_path: PathBuf,

    // Daemon listener
    pub listen_port: u16,
    /// Seconds to wait for active jobs to finish during graceful shutdown.
    pub shutdown_timeout_sec: u32,

    // Scheduler
    /// Maximum number of units running in parallel.
    pub parallelism: usize,
    /// Cap on total concurrently-managed jobs for the daemon.
    pub max_jobs: usize,
    /// Stop dispatching new units as soon as one fails.
    pub fail_fast: bool,

    // Worker
    pub target_branch: String,
    /// Prefix for unit branches (`<prefix>/<unit-id>-<short-random>`) and
    /// commit messages (`<prefix>(<unit>): task #N <title>`).
    pub branch_prefix: String,
    pub agent_bin: String,
    pub agent_permission_flag: String,
    pub baseline_checks: Vec<String>,
    pub max_agent_retries: u32,
    pub max_baseline_retries: u32,
    /// Seconds a worker waits for a concurrency slot before giving up.
    pub backpressure_timeout_sec: u32,
    pub agent_timeout_sec: u32,
    /// Timeout for a single completed task's validation command.
    pub task_validation_timeout_sec: u32,
    pub baseline_timeout_sec: u32,
    /// Skip pull-request creation; merge directly after baseline passes.
    pub no_pr: bool,

    // Merge queue
    pub merge_strategy: MergeStrategy,
    pub max_conflict_retries: u32,
    pub conflict_retry_initial_delay_sec: u32,
    pub conflict_retry_max_delay_sec: u32,
    pub conflict_retry_multiplier: f64,
    pub review_poll_interval_sec: u32,
    pub review_timeout_sec: u32,

    // Escalation fan-out
    pub escalation_webhook_url: Option<String>,
    pub escalation_chat_webhook_url: Option<String>,
    pub http_timeout_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("specs"),
            worktree_base: PathBuf::from(".loopd/worktrees"),
            db_path: PathBuf::from(".loopd/state.db"),
            pid_path: PathBuf::from(".loopd/daemon.pid"),

            listen_port: 7700,
            shutdown_timeout_sec: 30,

            parallelism: 10,
            max_jobs: 10,
            fail_fast: false,

            target_branch: "main".to_string(),
            branch_prefix: "unit".to_string(),
            agent_bin: "claude".to_string(),
            agent_permission_flag: "dangerously-skip-permissions".to_string(),
            baseline_checks: Vec::new(),
            max_agent_retries: 3,
            max_baseline_retries: 3,
            backpressure_timeout_sec: 300,
            agent_timeout_sec: 600,
            task_validation_timeout_sec: 300,
            baseline_timeout_sec: 600,
            no_pr: false,

            merge_strategy: MergeStrategy::Squash,
            max_conflict_retries: 3,
            conflict_retry_initial_delay_sec: 1,
            conflict_retry_max_delay_sec: 30,
            conflict_retry_multiplier: 2.0,
            review_poll_interval_sec: 30,
            review_timeout_sec: 7200,

            escalation_webhook_url: None,
            escalation_chat_webhook_url: None,
            http_timeout_sec: 10,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, path.display().to_string())
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: String) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, &source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, _source: &str) -> Result<(), ConfigError> {
        match key {
            "specs_dir" => self.specs_dir = PathBuf::from(value),
            "worktree_base" => self.worktree_base = PathBuf::from(value),
            "db_path" => self.db_path = PathBuf::from(value),
            "pid_path" => self.pid_path = PathBuf::from(value),
            "listen_port" => self.listen_port = Self::parse_int(key, value)?,
            "shutdown_timeout_sec" => self.shutdown_timeout_sec = Self::parse_int(key, value)?,
            "parallelism" => self.parallelism = Self::parse_int(key, value)?,
            "max_jobs" => self.max_jobs = Self::parse_int(key, value)?,
            "fail_fast" => self.fail_fast = Self::parse_bool(key, value)?,
            "target_branch" => self.target_branch = value.to_string(),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "agent_bin" => self.agent_bin = value.to_string(),
            "agent_permission_flag" => self.agent_permission_flag = value.to_string(),
            "baseline_checks" => {
                self.baseline_checks = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "max_agent_retries" => self.max_agent_retries = Self::parse_int(key, value)?,
            "max_baseline_retries" => self.max_baseline_retries = Self::parse_int(key, value)?,
            "backpressure_timeout_sec" => {
                self.backpressure_timeout_sec = Self::parse_int(key, value)?;
            }
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "task_validation_timeout_sec" => {
                self.task_validation_timeout_sec = Self::parse_int(key, value)?;
            }
            "baseline_timeout_sec" => self.baseline_timeout_sec = Self::parse_int(key, value)?,
            "no_pr" => self.no_pr = Self::parse_bool(key, value)?,
            "merge_strategy" => {
                self.merge_strategy = match value {
                    "squash" => MergeStrategy::Squash,
                    "merge" => MergeStrategy::Merge,
                    "rebase" => MergeStrategy::Rebase,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "merge_strategy must be 'squash', 'merge', or 'rebase', got '{value}'"
                        )))
                    }
                }
            }
            "max_conflict_retries" => self.max_conflict_retries = Self::parse_int(key, value)?,
            "conflict_retry_initial_delay_sec" => {
                self.conflict_retry_initial_delay_sec = Self::parse_int(key, value)?;
            }
            "conflict_retry_max_delay_sec" => {
                self.conflict_retry_max_delay_sec = Self::parse_int(key, value)?;
            }
            "conflict_retry_multiplier" => {
                self.conflict_retry_multiplier =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "review_poll_interval_sec" => {
                self.review_poll_interval_sec = Self::parse_int(key, value)?;
            }
            "review_timeout_sec" => self.review_timeout_sec = Self::parse_int(key, value)?,
            "escalation_webhook_url" => self.escalation_webhook_url = Some(value.to_string()),
            "escalation_chat_webhook_url" => {
                self.escalation_chat_webhook_url = Some(value.to_string());
            }
            "http_timeout_sec" => self.http_timeout_sec = Self::parse_int(key, value)?,
            _ => {
                // Unknown keys are warned about, not fatal, matching bin/loop.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value, accepting the same variants as `bin/loop`.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.specs_dir.is_relative() {
            self.specs_dir = workspace_root.join(&self.specs_dir);
        }
        if self.worktree_base.is_relative() {
            self.worktree_base = workspace_root.join(&self.worktree_base);
        }
        if self.db_path.is_relative() {
            self.db_path = workspace_root.join(&self.db_path);
        }
        if self.pid_path.is_relative() {
            self.pid_path = workspace_root.join(&self.pid_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.parallelism, 10);
        assert_eq!(config.merge_strategy, MergeStrategy::Squash);
        assert!(!config.fail_fast);
        assert!(!config.no_pr);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
parallelism=4
target_branch="develop"
fail_fast=true
merge_strategy=rebase
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.target_branch, "develop");
        assert!(config.fail_fast);
        assert_eq!(config.merge_strategy, MergeStrategy::Rebase);
    }

    #[test]
    fn parse_baseline_checks() {
        let mut config = Config::default();
        let content = r#"baseline_checks="cargo test | cargo clippy""#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.baseline_checks, vec!["cargo test", "cargo clippy"]);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "yes").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "false").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "no").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
    }

    #[test]
    fn parse_invalid_merge_strategy_errors() {
        let mut config = Config::default();
        let result = config.parse_content("merge_strategy=bogus", "test".into());
        assert!(result.is_err());
    }

    #[test]
    fn parse_conflict_retry_settings() {
        let mut config = Config::default();
        let content = r#"
max_conflict_retries=5
conflict_retry_initial_delay_sec=2
conflict_retry_max_delay_sec=60
conflict_retry_multiplier=1.5
review_poll_interval_sec=15
review_timeout_sec=3600
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.max_conflict_retries, 5);
        assert_eq!(config.conflict_retry_initial_delay_sec, 2);
        assert_eq!(config.conflict_retry_max_delay_sec, 60);
        assert!((config.conflict_retry_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.review_poll_interval_sec, 15);
        assert_eq!(config.review_timeout_sec, 3600);
    }

    #[test]
    fn parse_daemon_and_escalation_settings() {
        let mut config = Config::default();
        let content = r#"
listen_port=9100
shutdown_timeout_sec=5
branch_prefix="task"
escalation_webhook_url="https://example.invalid/hook"
escalation_chat_webhook_url="https://chat.example.invalid/hook"
http_timeout_sec=20
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.shutdown_timeout_sec, 5);
        assert_eq!(config.branch_prefix, "task");
        assert_eq!(
            config.escalation_webhook_url.as_deref(),
            Some("https://example.invalid/hook")
        );
        assert_eq!(
            config.escalation_chat_webhook_url.as_deref(),
            Some("https://chat.example.invalid/hook")
        );
        assert_eq!(config.http_timeout_sec, 20);
    }

    #[test]
    fn resolve_paths_joins_relative_dirs() {
        let mut config = Config::default();
        config.resolve_paths(Path::new("/workspace"));
        assert_eq!(config.specs_dir, PathBuf::from("/workspace/specs"));
        assert_eq!(
            config.worktree_base,
            PathBuf::from("/workspace/.loopd/worktrees")
        );
        assert_eq!(config.pid_path, PathBuf::from("/workspace/.loopd/daemon.pid"));
    }
}
