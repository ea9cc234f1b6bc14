//! External command execution with timeout and cancellation.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ReleaseError, Result};

/// An external command to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Label used in logs and errors.
    pub name: String,

    /// Command line; first element is the executable.
    pub argv: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Data written to stdin (then closed).
    pub stdin: Option<String>,

    /// Timeout in seconds; 0 disables the bound.
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            env: BTreeMap::new(),
            stdin: None,
            timeout_secs: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, or the exit code when stderr is silent.
    pub fn failure_reason(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("exited with code {}", self.exit_code))
    }
}

/// Runs external commands.
pub struct ProcessRunner;

impl ProcessRunner {
    /// Execute a command to completion.
    ///
    /// A non-zero exit is returned as `Ok`; spawn failures, timeouts and
    /// cancellation are errors. The child is killed on timeout or cancel.
    pub async fn execute(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        let start = Instant::now();

        let (exe, args) = spec.argv.split_first().ok_or_else(|| ReleaseError::Process {
            command: spec.name.clone(),
            reason: "empty command".to_string(),
        })?;

        debug!(command = %spec.name, exe = %exe, "spawning");

        let mut child = Command::new(exe)
            .args(args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ReleaseError::Process {
                command: spec.name.clone(),
                reason: format!("failed to spawn {exe}: {e}"),
            })?;

        if let (Some(data), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(data.as_bytes()).await?;
            drop(stdin);
        }

        let wait = child.wait_with_output();
        let bounded = async {
            if spec.timeout_secs == 0 {
                return wait.await.map_err(ReleaseError::from);
            }
            match tokio::time::timeout(Duration::from_secs(spec.timeout_secs), wait).await {
                Ok(res) => res.map_err(ReleaseError::from),
                Err(_) => Err(ReleaseError::Process {
                    command: spec.name.clone(),
                    reason: format!("timed out after {} seconds", spec.timeout_secs),
                }),
            }
        };

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!(command = %spec.name, "command cancelled");
                return Err(ReleaseError::Cancelled(spec.name.clone()));
            }
            res = bounded => res?,
        };

        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Execute and require a zero exit status.
    pub async fn execute_checked(
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let output = Self::execute(spec, cancel).await?;
        if !output.success() {
            return Err(ReleaseError::Process {
                command: spec.name.clone(),
                reason: output.failure_reason(),
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> CommandSpec {
        CommandSpec::new(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn test_failure_reason_prefers_stderr() {
        let output = CommandOutput {
            name: "build".to_string(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "warning\nerror: no space left\n\n".to_string(),
            duration_ms: 5,
        };
        assert_eq!(output.failure_reason(), "error: no space left");
    }

    #[test]
    fn test_failure_reason_falls_back_to_exit_code() {
        let output = CommandOutput {
            name: "build".to_string(),
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 5,
        };
        assert_eq!(output.failure_reason(), "exited with code 3");
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let spec = CommandSpec::new("echo_test", vec!["echo".to_string(), "hello".to_string()]);
        let result = ProcessRunner::execute(&spec, &CancellationToken::new())
            .await
            .expect("execute failed");
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command_is_ok_but_unsuccessful() {
        let spec = CommandSpec::new("false_test", vec!["false".to_string()]);
        let result = ProcessRunner::execute(&spec, &CancellationToken::new())
            .await
            .expect("execute failed");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_execute_checked_rejects_non_zero_exit() {
        let spec = sh("fail", "echo broken >&2; exit 4");
        let err = ProcessRunner::execute_checked(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_stdin_and_env_are_passed() {
        let spec = sh("stdin", "read line; echo \"$line-$SUPCI_TEST\"")
            .with_stdin("secret\n")
            .with_env("SUPCI_TEST", "env");
        let result = ProcessRunner::execute(&spec, &CancellationToken::new())
            .await
            .expect("execute failed");
        assert_eq!(result.stdout.trim(), "secret-env");
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let spec = sh("sleepy", "sleep 5").with_timeout(1);
        let err = ProcessRunner::execute(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = sh("sleepy", "sleep 5");
        let err = ProcessRunner::execute(&spec, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let spec = CommandSpec::new("empty", vec![]);
        assert!(ProcessRunner::execute(&spec, &CancellationToken::new())
            .await
            .is_err());
    }
}
