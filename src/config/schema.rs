//! Configuration schema definitions for drover.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section has defaults, so an empty file is
//! a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── DroverConfig           - Core settings (workers, timeouts, paths)
//! │   └── RetryConfig        - Discovery/provisioning retry policy
//! ├── SandboxConfig          - Shell, working directory, environment
//! ├── WorkspaceConfig (map)  - Per-workspace scripts, runner, resources
//! │   └── ResourceConfig     - Resource kinds leased per job
//! ├── QueueConfig            - Queue server address, order, pull retries
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Name of the implicit workspace used when a build names none.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Root configuration structure for drover.
///
/// # TOML Structure
///
/// ```toml
/// [drover]
/// max_workers = 8
/// run_command = "python -m unittest {test_id}"
///
/// [workspaces.api]
/// setup = "scripts/create_db.sh"
/// teardown = "scripts/drop_db.sh"
/// resources = [{ kind = "db", max_slots = 4 }]
///
/// [report]
/// output_dir = "test-results"
/// ```
///
/// # Example
///
/// ```
/// use drover::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [drover]
///     max_workers = 2
/// "#).unwrap();
/// assert_eq!(config.drover.max_workers, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core drover settings.
    #[serde(default)]
    pub drover: DroverConfig,

    /// How commands are executed on a worker.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Named workspaces selecting scripts, runner and resources.
    #[serde(default)]
    pub workspaces: HashMap<String, WorkspaceConfig>,

    /// Queue server and pull client settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Looks up a workspace by name.
    ///
    /// `None` and `"default"` resolve to the `default` entry when one is
    /// configured, otherwise to an empty workspace with no scripts. Any other
    /// unknown name returns `None`.
    pub fn workspace(&self, name: Option<&str>) -> Option<WorkspaceConfig> {
        let name = name.unwrap_or(DEFAULT_WORKSPACE);
        match self.workspaces.get(name) {
            Some(ws) => Some(ws.clone()),
            None if name == DEFAULT_WORKSPACE => Some(WorkspaceConfig::default()),
            None => None,
        }
    }

    /// Runner template for a workspace, falling back to `drover.run_command`.
    pub fn run_command(&self, workspace: Option<&str>) -> Option<String> {
        self.workspace(workspace)
            .and_then(|ws| ws.run_command)
            .or_else(|| self.drover.run_command.clone())
    }

    /// Directory holding advisory lock files, with `~` expanded.
    pub fn lock_dir(&self) -> PathBuf {
        expand_path(&self.drover.lock_dir)
    }

    /// Workspace root, with `~` expanded.
    pub fn root(&self) -> PathBuf {
        expand_path(&self.drover.root)
    }

    /// Directory exported as `WORKSPACE` for the given workspace.
    pub fn workspace_dir(&self, workspace: Option<&str>) -> PathBuf {
        self.root().join(workspace.unwrap_or(DEFAULT_WORKSPACE))
    }
}

fn expand_path(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Core drover execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_workers` | 4 |
/// | `local_workers` | 4 |
/// | `job_timeout_secs` | 900 (15 minutes) |
/// | `root` | `drover` |
/// | `lock_dir` | `/var/tmp` |
/// | `provisioning.max_attempts` | 60 |
/// | `provisioning.delay_ms` | 1000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DroverConfig {
    /// Maximum number of workers provisioned for one build.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Number of workers started by the in-process broker.
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,

    /// Per-job timeout in seconds. Zero disables the timeout.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Root directory for workspaces.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Directory for resource lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Default runner command template (must contain `{test_id}`).
    #[serde(default)]
    pub run_command: Option<String>,

    /// Shell command printing one test unit per line.
    #[serde(default)]
    pub discover_command: Option<String>,

    /// Seconds without any result after which outstanding jobs are lost.
    #[serde(default)]
    pub result_timeout_secs: Option<u64>,

    /// Upper bound on builds running concurrently on this host.
    #[serde(default)]
    pub max_concurrent_builds: Option<usize>,

    /// Retry policy for worker discovery and provisioning.
    #[serde(default = "default_provisioning_retry")]
    pub provisioning: RetryConfig,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            local_workers: default_local_workers(),
            job_timeout_secs: default_job_timeout(),
            root: default_root(),
            lock_dir: default_lock_dir(),
            run_command: None,
            discover_command: None,
            result_timeout_secs: None,
            max_concurrent_builds: None,
            provisioning: default_provisioning_retry(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_local_workers() -> usize {
    4
}

fn default_job_timeout() -> u64 {
    900 // 15 minutes
}

fn default_root() -> PathBuf {
    PathBuf::from("drover")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_provisioning_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: Some(60),
        delay_ms: 1000,
        backoff: BackoffKind::Fixed,
        max_delay_ms: default_max_delay(),
        jitter: false,
    }
}

/// Retry policy settings.
///
/// ```toml
/// [drover.provisioning]
/// max_attempts = 10
/// delay_ms = 500
/// backoff = "exponential"
/// max_delay_ms = 10000
/// jitter = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts allowed. `None` retries until cancelled.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_delay")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Ceiling for exponential backoff, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Add up to 25% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

fn default_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// How commands run on a worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Shell used to interpret command lines and script files.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for jobs; the current directory when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for every job and script.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// A named execution context for builds.
///
/// Scripts are either a path to an existing file, run as `<shell> <path>`,
/// or an inline shell string. Both see `BUILD_ID`, `WORKSPACE` and
/// `DROVER_WORKER` in their environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    /// Run on each provisioned worker before it joins the build queue.
    #[serde(default)]
    pub setup: Option<String>,

    /// Run on each worker before it rejoins the default pool.
    #[serde(default)]
    pub teardown: Option<String>,

    /// Runner template overriding `drover.run_command`.
    #[serde(default)]
    pub run_command: Option<String>,

    /// Resource slots leased for every job of this workspace.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// A resource kind whose slots are leased per job.
///
/// The leased slot number is exported as `DROVER_<KIND>_SLOT`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceConfig {
    pub kind: String,

    /// Number of slots available on a host; unbounded when unset.
    #[serde(default)]
    pub max_slots: Option<usize>,
}

/// Queue server and pull client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Address the server binds to and clients connect to.
    #[serde(default = "default_address")]
    pub address: String,

    /// Order in which the backlog is served.
    #[serde(default)]
    pub order: BacklogOrder,

    /// Seconds the server waits for registered workers after cancellation.
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,

    /// Pull client retry policy for unreachable servers.
    #[serde(default = "default_pull_retry")]
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            order: BacklogOrder::default(),
            drain_grace_secs: default_drain_grace(),
            retry: default_pull_retry(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8011".to_string()
}

fn default_drain_grace() -> u64 {
    30
}

fn default_pull_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: Some(3),
        delay_ms: 500,
        backoff: BackoffKind::Fixed,
        max_delay_ms: default_max_delay(),
        jitter: true,
    }
}

/// Order in which the queue server hands out pending units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BacklogOrder {
    /// Units are served in the order they were supplied.
    #[default]
    Fifo,
    /// The most recently supplied unit is served first.
    Lifo,
}

/// Report configuration for test output.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `test-results` |
/// | `junit` | `true` |
/// | `junit_file` | `junit.xml` |
/// | `xunit_dir` | None |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for report files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a merged JUnit XML file.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// File name of the merged JUnit XML, relative to `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Directory receiving each job's raw structured report.
    #[serde(default)]
    pub xunit_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
            xunit_dir: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.drover.max_workers, 4);
        assert_eq!(config.drover.job_timeout_secs, 900);
        assert_eq!(config.drover.lock_dir, PathBuf::from("/var/tmp"));
        assert_eq!(config.drover.provisioning.max_attempts, Some(60));
        assert_eq!(config.sandbox.shell, "/bin/sh");
        assert_eq!(config.queue.address, "0.0.0.0:8011");
        assert_eq!(config.queue.order, BacklogOrder::Fifo);
        assert_eq!(config.queue.retry.max_attempts, Some(3));
        assert!(config.queue.retry.jitter);
        assert!(!config.drover.provisioning.jitter);
        assert!(config.report.junit);
        assert!(config.workspaces.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [drover]
            max_workers = 8
            run_command = "pytest {test_id}"
            result_timeout_secs = 120

            [drover.provisioning]
            delay_ms = 250
            backoff = "exponential"
            jitter = true

            [sandbox]
            shell = "/bin/bash"
            env = { PYTHONPATH = "src" }

            [workspaces.api]
            setup = "createdb api_$BUILD_ID"
            teardown = "dropdb api_$BUILD_ID"
            run_command = "python manage.py test {test_id}"
            resources = [{ kind = "db", max_slots = 4 }, { kind = "redis" }]

            [queue]
            order = "lifo"

            [report]
            junit = false
            xunit_dir = "results/jobs"
            "#,
        )
        .unwrap();

        assert_eq!(config.drover.max_workers, 8);
        assert_eq!(config.drover.result_timeout_secs, Some(120));
        assert_eq!(config.drover.provisioning.max_attempts, None);
        assert_eq!(config.drover.provisioning.backoff, BackoffKind::Exponential);
        assert!(config.drover.provisioning.jitter);
        assert_eq!(config.sandbox.env["PYTHONPATH"], "src");
        assert_eq!(config.queue.order, BacklogOrder::Lifo);
        assert!(!config.report.junit);

        let api = config.workspace(Some("api")).unwrap();
        assert_eq!(api.resources.len(), 2);
        assert_eq!(api.resources[0].max_slots, Some(4));
        assert_eq!(api.resources[1].max_slots, None);
        assert_eq!(
            config.run_command(Some("api")).as_deref(),
            Some("python manage.py test {test_id}")
        );
        assert_eq!(config.run_command(None).as_deref(), Some("pytest {test_id}"));
    }

    #[test]
    fn test_workspace_lookup() {
        let config = Config::default();
        assert!(config.workspace(None).is_some());
        assert!(config.workspace(Some("default")).is_some());
        assert!(config.workspace(Some("missing")).is_none());
        assert_eq!(
            config.workspace_dir(Some("api")),
            PathBuf::from("drover").join("api")
        );
    }

    #[test]
    fn test_unknown_backoff_rejected() {
        let result: Result<RetryConfig, _> = toml::from_str(r#"backoff = "linear""#);
        assert!(result.is_err());
    }
}
