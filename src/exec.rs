//! Process execution for every external tool the orchestrator drives
//!
//! Commands are always an explicit program plus argument vector; nothing is
//! ever passed through a shell. [`SystemRunner`] executes them and re-emits
//! their output through `tracing` so it lands in the per-site log, while
//! [`DryRunRunner`] only logs what would have run.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Number of trailing stderr lines kept in a failure
const STDERR_TAIL_LINES: usize = 20;

/// A program invocation described as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// First argument, i.e. the subcommand for tools like `podman` or `git`
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        f.write_str(&shell_words::join(words))
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl CommandError {
    /// Stderr of a failed command, empty for spawn failures
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Spawn { .. } => "",
            CommandError::Failed { stderr, .. } => stderr,
        }
    }
}

/// Executes commands on behalf of the orchestrator
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// True when commands are only logged, never executed
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs commands with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        info!(command = %spec, "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let spawn_error = |source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(spawn_error(std::io::Error::other("child stdio was not captured")));
        };

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut out_lines = Vec::new();
        let mut err_lines = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        info!(target: "siteforge::cmd", "{}", line);
                        out_lines.push(line);
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Error reading stdout: {}", e);
                        stdout_open = false;
                    }
                },
                line = stderr_reader.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        info!(target: "siteforge::cmd", "{}", line);
                        err_lines.push(line);
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!("Error reading stderr: {}", e);
                        stderr_open = false;
                    }
                },
            }
        }

        let status = child.wait().await.map_err(spawn_error)?;
        debug!(command = %spec, status = ?status.code(), "Command finished");

        if status.success() {
            Ok(CommandOutput {
                stdout: join_lines(&out_lines),
                stderr: join_lines(&err_lines),
            })
        } else {
            let tail_start = err_lines.len().saturating_sub(STDERR_TAIL_LINES);
            Err(CommandError::Failed {
                command: spec.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: err_lines[tail_start..].join("\n"),
            })
        }
    }
}

/// Logs commands without executing them
#[derive(Debug, Default, Clone)]
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        info!(command = %spec, "Safe mode, skipping command");
        Ok(CommandOutput::default())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut joined = lines.join("\n");
    if !joined.is_empty() {
        joined.push('\n');
    }
    joined
}
