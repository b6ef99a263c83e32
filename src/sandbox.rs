//! Execution sandboxes for running a single command.
//!
//! A [`Sandbox`] runs one concrete command as a child process and reports
//! what happened. It never retries: a command that exits non-zero, or
//! times out, is reported once and the caller decides what to do.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                               │
//! │                                                              │
//! │  exec(Command) ───► ExecResult { exit_code, stdout,          │
//! │                                  stderr, started_at,         │
//! │                                  duration }                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Sandboxes
//!
//! | Sandbox | Module | Description |
//! |---------|--------|-------------|
//! | Local | [`local`] | Run commands as local child processes via a shell |
//!
//! # Error Handling
//!
//! [`SandboxError`] covers failures to run the command at all. A command that
//! runs and exits non-zero is NOT an error; it is an [`ExecResult`] whose
//! [`success`](ExecResult::success) is `false`.

pub mod local;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use local::LocalSandbox;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur while executing a command.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The command could not be started or its output could not be collected.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The command ran longer than its timeout and was killed.
    #[error("Command timed out after {0}s")]
    Timeout(u64),

    /// I/O error while preparing the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute in a sandbox.
///
/// Built with a fluent API. A command is either a program with arguments,
/// which are shell-escaped, or a raw shell line created with
/// [`Command::script`].
///
/// # Example
///
/// ```
/// use drover::sandbox::Command;
///
/// let cmd = Command::new("pytest")
///     .arg("-x")
///     .arg("tests/test api.py")
///     .env("PYTHONPATH", "src")
///     .timeout(300);
///
/// assert_eq!(cmd.to_shell_string(), "pytest -x 'tests/test api.py'");
///
/// let line = Command::script("echo a | tr a b");
/// assert_eq!(line.to_shell_string(), "echo a | tr a b");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program to run, or the whole shell line for script commands.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    ///
    /// If `None`, uses the sandbox's default working directory.
    pub working_dir: Option<PathBuf>,

    /// Environment variables layered over the sandbox's environment.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,

    raw: bool,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            raw: false,
        }
    }

    /// Creates a command from a shell line that is passed through unescaped.
    pub fn script(line: impl Into<String>) -> Self {
        Self {
            raw: true,
            ..Self::new(line)
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds. Zero disables the timeout.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = (secs > 0).then_some(secs);
        self
    }

    /// Converts the command to a shell-executable string.
    pub fn to_shell_string(&self) -> String {
        if self.raw {
            let mut line = self.program.clone();
            for arg in &self.args {
                line.push(' ');
                line.push_str(&shell_escape(arg));
            }
            return line;
        }
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Result of executing a command in a sandbox.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command, `-1` if it was terminated by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// When the child process was started.
    pub started_at: DateTime<Utc>,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// When the command finished.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.started_at
            + chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::zero())
    }
}

/// An environment that executes commands.
///
/// Sandboxes are shared between concurrently running jobs, so they must be
/// `Send + Sync` and `exec` takes `&self`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the identifier used in logs.
    fn id(&self) -> &str;

    /// Runs the command to completion and captures its output.
    ///
    /// # Errors
    ///
    /// - `SandboxError::ExecFailed` - the process could not be spawned
    /// - `SandboxError::Timeout` - the process exceeded `cmd.timeout_secs`
    async fn exec(&self, cmd: &Command) -> SandboxResult<ExecResult>;
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
