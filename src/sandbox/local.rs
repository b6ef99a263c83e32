//! Local child-process sandbox.
//!
//! Runs each command as `<shell> -c "<command line>"` on the local machine.
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Timeouts | Yes, the child is killed when the limit is reached |
//! | Parallel execution | Yes, `exec` may be called concurrently |
//!
//! # Example Configuration
//!
//! ```toml
//! [sandbox]
//! shell = "/bin/bash"
//! working_dir = "/path/to/project"
//!
//! [sandbox.env]
//! PYTHONPATH = "/path/to/project/src"
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{Command, ExecResult, Sandbox, SandboxError, SandboxResult};
use crate::config::SandboxConfig;

/// A sandbox that runs commands as local child processes.
///
/// Commands inherit the sandbox environment, then the command's own
/// environment on top. Children are killed if the future running them is
/// dropped, so an abandoned job never outlives its worker.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalSandbox {
    /// Creates a sandbox from the `[sandbox]` configuration.
    pub fn new(id: impl Into<String>, config: &SandboxConfig) -> Self {
        let mut env: Vec<_> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        Self {
            id: id.into(),
            working_dir: config.working_dir.clone(),
            env,
            shell: config.shell.clone(),
        }
    }

    /// The shell used to interpret command lines.
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, cmd: &Command) -> SandboxResult<ExecResult> {
        let shell_cmd = cmd.to_shell_string();
        debug!("[{}] exec: {}", self.id, shell_cmd);

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);

        if let Some(dir) = cmd.working_dir.as_ref().or(self.working_dir.as_ref()) {
            process.current_dir(dir);
        }
        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let started_at = Utc::now();
        let start = Instant::now();

        let child = process
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(format!("{}: {}", self.shell, e)))?;

        let output = if let Some(timeout) = cmd.timeout_secs {
            tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output())
                .await
                .map_err(|_| SandboxError::Timeout(timeout))?
                .map_err(|e| SandboxError::ExecFailed(e.to_string()))?
        } else {
            child
                .wait_with_output()
                .await
                .map_err(|e| SandboxError::ExecFailed(e.to_string()))?
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            started_at,
            duration: start.elapsed(),
        })
    }
}
