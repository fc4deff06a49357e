//! Coding-agent subprocess invocation (spec Section 4.2).
//!
//! One [`Agent::run_step`] call is one invocation of the configured coding
//! agent binary against a single prompt, inside a unit's worktree. Retry
//! policy (how many attempts a task gets) lives in the worker's task loop,
//! which persists `agent_retries` on the unit between attempts; this module
//! only knows how to run one attempt to completion, to a wall-clock timeout,
//! or to cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use loop_core::Config;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent binary '{0}' not found on PATH")]
    BinaryNotFound(String),
    #[error("agent timed out after {0}s")]
    Timeout(u32),
    #[error("step cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Result of one successful (zero-exit) agent invocation.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub log_path: PathBuf,
    pub output: String,
}

/// Invokes the configured coding-agent binary as a subprocess.
pub struct Agent {
    bin: String,
    permission_flag: String,
    timeout: Duration,
}

impl Agent {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bin: config.agent_bin.clone(),
            permission_flag: config.agent_permission_flag.clone(),
            timeout: Duration::from_secs(config.agent_timeout_sec as u64),
        }
    }

    #[cfg(test)]
    pub fn new(bin: impl Into<String>, permission_flag: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            permission_flag: permission_flag.into(),
            timeout,
        }
    }

    /// Run one step: spawn the agent with `prompt` inside `worktree`,
    /// capture its combined output under `log_dir/iter-NN.log`, and wait for
    /// it to exit, time out, or be cancelled.
    pub async fn run_step(
        &self,
        worktree: &Path,
        log_dir: &Path,
        iteration: u32,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        fs::create_dir_all(log_dir).await?;
        let log_path = log_dir.join(format!("iter-{iteration:02}.log"));
        let flag = format!("--{}", self.permission_flag);

        let mut command = Command::new(&self.bin);
        command
            .current_dir(worktree)
            .arg("-p")
            .arg(&flag)
            .arg(prompt)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AgentError::BinaryNotFound(self.bin.clone())
            } else {
                AgentError::Io(err)
            }
        })?;

        let started = Instant::now();
        info!(bin = %self.bin, iteration, log_path = %log_path.display(), "starting agent step");

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(iteration, "agent step cancelled");
                return Err(AgentError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(err)) => return Err(AgentError::Io(err)),
                    Err(_) => {
                        warn!(iteration, timeout_sec = self.timeout.as_secs(), "agent step timed out");
                        return Err(AgentError::Timeout(self.timeout.as_secs() as u32));
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let mut file = fs::File::create(&log_path).await?;
        file.write_all(combined.as_bytes()).await?;

        let exit_code = output.status.code().unwrap_or(-1);
        info!(iteration, exit_code, duration_ms, "agent step finished");

        if !output.status.success() {
            // A nonzero exit only signals a gross subprocess failure; it is
            // never the source of truth for task completion (that's the
            // on-disk task header), so callers still inspect headers after a
            // nonzero exit rather than treating this as fatal.
            warn!(iteration, exit_code, "agent exited nonzero; caller will re-read task headers regardless");
        }

        Ok(StepOutcome {
            exit_code,
            duration_ms,
            log_path,
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio_util::sync::CancellationToken;

    /// Writes an executable shell script standing in for the agent binary.
    /// Real agent CLIs take `-p --<flag> <prompt>`; these stubs ignore their
    /// arguments entirely, which is fine since `agent.rs` never inspects them.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("agent-stub.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn runs_successful_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "echo hi; exit 0");
        let agent = Agent::new(script.display().to_string(), "x", Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let outcome = agent
            .run_step(dir.path(), dir.path(), 0, "prompt", &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("hi"));
        assert!(outcome.log_path.exists());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        // Exit code is never the source of truth for task completion (the
        // on-disk task header is); a nonzero exit still returns a usable
        // `StepOutcome` so the caller can re-read headers regardless.
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "exit 7");
        let agent = Agent::new(script.display().to_string(), "x", Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let outcome = agent
            .run_step(dir.path(), dir.path(), 0, "prompt", &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn missing_binary_reports_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let agent = Agent::new("definitely-not-a-real-binary", "x", Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let err = agent
            .run_step(dir.path(), dir.path(), 0, "prompt", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn cancellation_before_start_is_immediate() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "sleep 5");
        let agent = Agent::new(script.display().to_string(), "x", Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent
            .run_step(dir.path(), dir.path(), 0, "prompt", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "sleep 5");
        let agent = Agent::new(script.display().to_string(), "x", Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let err = agent
            .run_step(dir.path(), dir.path(), 0, "prompt", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }
}
