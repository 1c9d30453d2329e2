//! External command execution
//!
//! Everything `butleradm` shells out to (kind, docker) goes through
//! [`CommandRunner`] so the orchestration can be tested without the tools.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use butler_common::{Error, Result, RunContext};

/// A command line to execute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name, resolved on PATH
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Data written to stdin, if any
    pub stdin: Option<String>,
    /// Working directory, if not the current one
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pipe `input` to the command's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run in `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal
    pub status: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; only failing to start is.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %command, "running");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (cancellation, deadline) must not leave the child running
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::environment(format!("failed to run {}: {}", command.program, e))
        })?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `command` under `ctx` and fail unless it exits successfully
pub async fn run_checked(
    runner: &dyn CommandRunner,
    ctx: &RunContext,
    command: &CommandSpec,
) -> Result<CommandOutput> {
    let description = command.to_string();
    let output = ctx.run(&description, runner.run(command)).await?;
    if !output.success() {
        return Err(Error::environment(format!(
            "{} failed: {}",
            description,
            output.stderr.trim()
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_command_display() {
        let cmd = CommandSpec::new("kind").args(["get", "clusters"]);
        assert_eq!(cmd.to_string(), "kind get clusters");
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failed(1, "boom\n")));

        let ctx = RunContext::new(CancellationToken::new());
        let err = run_checked(&runner, &ctx, &CommandSpec::new("kind").args(["version"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "environment error: kind version failed: boom");
    }

    #[tokio::test]
    async fn test_run_checked_observes_cancellation() {
        let runner = MockCommandRunner::new();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RunContext::with_timeout(token, Duration::from_secs(5));

        let err = run_checked(&runner, &ctx, &CommandSpec::new("kind"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_system_runner_pipes_stdin() {
        let output = SystemRunner
            .run(&CommandSpec::new("cat").stdin("hello"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_missing_program_is_environment_error() {
        let err = SystemRunner
            .run(&CommandSpec::new("butler-definitely-not-installed"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Environment { .. }));
    }
}
