//! External command execution.
//!
//! Every external collaborator (docker, cosign, aws, silkbomb) is reached
//! through a [`CommandRunner`]. Production code uses [`TokioCommandRunner`];
//! tests swap in [`crate::fakes::ScriptedRunner`].

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;
use crate::Result;

/// A single external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Executable name or path.
    pub program: String,

    /// Arguments, in order.
    pub args: Vec<String>,

    /// Extra environment variables. Values are never logged.
    #[serde(skip_serializing)]
    pub env: Vec<(String, String)>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Space-joined command line, used for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`ToolError::Failed`].
    pub fn check(self, invocation: &Invocation) -> Result<CommandOutput> {
        if self.passed() {
            Ok(self)
        } else {
            Err(ToolError::Failed {
                command: invocation.command_line(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation to completion. A non-zero exit is NOT an error here.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run the invocation and fail on non-zero exit.
    async fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.run(invocation).await?.check(invocation)
    }
}

/// Runs commands as child processes on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        if invocation.program.is_empty() {
            return Err(ToolError::InvalidInvocation("empty program".to_string()));
        }

        let start = Instant::now();
        debug!(command = %invocation, "spawning");

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let output = if invocation.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(invocation.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ToolError::Timeout {
                command: invocation.command_line(),
                timeout_secs: invocation.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %invocation,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_args() {
        let inv = Invocation::new("docker")
            .args(["manifest", "push"])
            .arg("quay.io/org/img:1.0.0");
        assert_eq!(inv.command_line(), "docker manifest push quay.io/org/img:1.0.0");
        assert_eq!(inv.to_string(), inv.command_line());
    }

    #[test]
    fn check_maps_non_zero_exit() {
        let inv = Invocation::new("false");
        let err = CommandOutput::failed(2, "boom").check(&inv).unwrap_err();
        match err {
            ToolError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn executes_simple_command() {
        let out = TokioCommandRunner::new()
            .run(&Invocation::new("echo").arg("hello"))
            .await
            .expect("execute failed");
        assert!(out.passed());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn failing_command_is_not_an_error_until_checked() {
        let runner = TokioCommandRunner::new();
        let inv = Invocation::new("false");
        let out = runner.run(&inv).await.expect("execute failed");
        assert!(!out.passed());
        assert!(runner.run_checked(&inv).await.is_err());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = TokioCommandRunner::new()
            .run(&Invocation::new("shipyard-definitely-not-a-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let out = TokioCommandRunner::new()
            .run(
                &Invocation::new("sh")
                    .args(["-c", "echo $SHIPYARD_PROBE"])
                    .env("SHIPYARD_PROBE", "visible"),
            )
            .await
            .expect("execute failed");
        assert_eq!(out.stdout.trim(), "visible");
    }
}
