//! Spawning native helper binaries with `DISPLAY` set and a deadline.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0} is not installed")]
    NotFound(String),

    #[error("Failed to execute {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Command {program} timed out after {after_ms}ms")]
    TimedOut { program: String, after_ms: u64 },
}

/// Failure of a backend call, already rendered for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<RunError> for BackendError {
    fn from(err: RunError) -> Self {
        Self(err.to_string())
    }
}

/// Why a probe exercise rejected a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailureReason {
    MissingDependency,
    NoDisplay,
    MissingPermission,
    InvalidResult,
    Failed,
}

impl fmt::Display for ProbeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingDependency => "missing_dependency",
            Self::NoDisplay => "no_display",
            Self::MissingPermission => "missing_permission",
            Self::InvalidResult => "invalid_result",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct ProbeFailure {
    pub reason: ProbeFailureReason,
    pub detail: String,
}

impl ProbeFailure {
    pub fn new(reason: ProbeFailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn invalid_result(detail: impl Into<String>) -> Self {
        Self::new(ProbeFailureReason::InvalidResult, detail)
    }

    /// Classify a failed exercise from the helper's stderr.
    pub fn from_stderr(program: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let reason = if lower.contains("can't open display")
            || lower.contains("cannot open display")
            || lower.contains("failed to connect to a wayland")
            || lower.contains("wayland_display")
            || lower.contains("compositor doesn't support")
        {
            ProbeFailureReason::NoDisplay
        } else if lower.contains("permission denied")
            || lower.contains("uinput")
            || lower.contains("ydotoold")
            || lower.contains("socket")
        {
            ProbeFailureReason::MissingPermission
        } else {
            ProbeFailureReason::Failed
        };
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            format!("{} exited with an error", program)
        } else {
            format!("{}: {}", program, detail)
        };
        Self::new(reason, detail)
    }
}

impl From<RunError> for ProbeFailure {
    fn from(err: RunError) -> Self {
        let reason = match &err {
            RunError::NotFound(_) => ProbeFailureReason::MissingDependency,
            RunError::Spawn { .. } | RunError::TimedOut { .. } => ProbeFailureReason::Failed,
        };
        Self::new(reason, err.to_string())
    }
}

/// Runs helper binaries against one display.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    display: String,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(display: impl Into<String>, timeout: Duration) -> Self {
        Self {
            display: display.into(),
            timeout,
        }
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, RunError> {
        self.run_with_input(program, args, None).await
    }

    /// Run `program`, optionally feeding `input` on stdin. The child is
    /// killed if the deadline passes.
    pub async fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, RunError> {
        tracing::debug!(program = %program, args = ?args, "Running helper");

        let mut child = Command::new(program)
            .args(args)
            .env("DISPLAY", &self.display)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RunError::NotFound(program.to_string()),
                _ => RunError::Spawn {
                    program: program.to_string(),
                    reason: e.to_string(),
                },
            })?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(data)
                .await
                .map_err(|e| RunError::Spawn {
                    program: program.to_string(),
                    reason: format!("writing stdin: {}", e),
                })?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RunError::Spawn {
                    program: program.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RunError::TimedOut {
                    program: program.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run and require exit code 0.
    pub async fn run_ok(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BackendError> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(BackendError(format!(
                "{} {} failed: {}",
                program,
                args.first().copied().unwrap_or_default(),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Run a probe exercise, classifying failures for diagnostics.
    pub async fn probe(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProbeFailure> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(ProbeFailure::from_stderr(program, &output.stderr));
        }
        Ok(output)
    }
}
