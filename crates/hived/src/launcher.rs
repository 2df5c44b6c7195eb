//! External coding-agent launcher.
//!
//! The daemon never talks to an LLM itself; it launches the external
//! coding-agent CLI in a working directory with a prompt and a timeout,
//! and consumes `{exit_code, stdout, stderr}`. Autonomous sub-agents run
//! with MCP tools disabled unless a flow explicitly re-enables them.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Result of one agent launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Exit code reported when the launch exceeds its timeout budget.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Launches one coding-agent subprocess per call.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        work_dir: &Path,
        prompt: &str,
        timeout: Duration,
        session_id: &str,
        disable_mcp: bool,
    ) -> Result<LaunchOutcome>;
}

/// Subprocess-backed launcher around the coding-agent CLI.
#[derive(Debug, Clone)]
pub struct AgentCli {
    bin: PathBuf,
    log_dir: PathBuf,
}

impl AgentCli {
    pub fn new(bin: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            log_dir: log_dir.into(),
        }
    }

    fn append_session_log(&self, session_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if std::fs::create_dir_all(&self.log_dir).is_err() {
            return;
        }
        let path = self.log_dir.join(format!("{session_id}.log"));
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(text.as_bytes()));
        if let Err(e) = appended {
            warn!(path = %path.display(), error = %e, "failed to append session log");
        }
    }
}

#[async_trait]
impl Launcher for AgentCli {
    async fn launch(
        &self,
        work_dir: &Path,
        prompt: &str,
        timeout: Duration,
        session_id: &str,
        disable_mcp: bool,
    ) -> Result<LaunchOutcome> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg(prompt)
            .current_dir(work_dir)
            .env("HIVE_SESSION_ID", session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if disable_mcp {
            cmd.arg("--no-mcp");
        }

        debug!(
            session_id,
            work_dir = %work_dir.display(),
            timeout_secs = timeout.as_secs(),
            disable_mcp,
            "launching coding agent"
        );

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        let outcome = match result {
            Ok(Ok(output)) => LaunchOutcome {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LauncherError::BinaryNotFound(
                    self.bin.to_string_lossy().to_string(),
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // kill_on_drop terminates the subprocess when the output
                // future is dropped by the timeout.
                warn!(session_id, timeout_secs = timeout.as_secs(), "agent launch timed out");
                LaunchOutcome {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("agent timed out after {}s", timeout.as_secs()),
                }
            }
        };

        self.append_session_log(session_id, &outcome.stderr);
        Ok(outcome)
    }
}
