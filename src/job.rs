//! Builds, test units, jobs and job results.
//!
//! These are the values that flow through a distributed run:
//!
//! ```text
//!   TestUnit ──(bound to Build + CommandTemplate)──► Job
//!                                                    │
//!                                       JobExecutor / PullClient
//!                                                    │
//!                                                    ▼
//!                                                JobResult ──► Aggregator
//! ```
//!
//! A [`Job`] moves through [`JobState`]: `Pending → Dispatched → Completed`,
//! or `Pending → Dispatched → Failed` when its result never arrives.

pub mod command;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use command::{CommandTemplate, TemplateError};

/// Opaque identifier of one distributed test run.
///
/// Generated as a 32-character hex token when the caller does not supply
/// one. The build-scoped queue name and lock file contents derive from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Wraps an existing build identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random build identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BuildId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One logical distributed test run.
#[derive(Debug, Clone)]
pub struct Build {
    /// Unique build identifier.
    pub id: BuildId,

    /// Selects setup/teardown scripts and the runner template.
    pub workspace: Option<String>,

    /// Upper bound on workers provisioned for this build.
    pub max_workers: usize,
}

impl Build {
    /// Creates a build, generating an id when none is given.
    pub fn new(id: Option<BuildId>, workspace: Option<String>, max_workers: usize) -> Self {
        Self {
            id: id.unwrap_or_else(BuildId::generate),
            workspace,
            max_workers: max_workers.max(1),
        }
    }
}

/// The smallest independently dispatchable piece of test work.
///
/// Only the identifier matters to drover; it is handed to the runner
/// template verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestUnit(String);

impl TestUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestUnit {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Sequence number of a job within its build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A test unit bound to a build and a concrete runner command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub unit: TestUnit,

    /// Shell command line produced by the [`CommandTemplate`].
    pub command: String,

    /// Workspace directory exported to the job as `WORKSPACE`.
    pub workspace: Option<String>,
}

/// Lifecycle of a job as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created but not yet published.
    Pending,
    /// Published to the build-scoped queue.
    Dispatched,
    /// A result was reported.
    Completed,
    /// The job was lost before reporting a result.
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Why a job produced no ordinary exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    /// The command exceeded the job timeout and was killed.
    TimedOut(u64),

    /// The command could not be started, or a resource slot was unavailable.
    Infrastructure(String),

    /// The job was dispatched but its result never came back.
    Lost(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::TimedOut(secs) => write!(f, "timed out after {}s", secs),
            JobFailure::Infrastructure(msg) => write!(f, "infrastructure failure: {}", msg),
            JobFailure::Lost(reason) => write!(f, "lost: {}", reason),
        }
    }
}

/// Outcome of executing one job.
///
/// A non-zero exit code is data, not an error: it is carried here and
/// classified later by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub build_id: BuildId,
    pub test_id: String,

    /// Worker that ran the job, when known.
    #[serde(default)]
    pub worker: Option<String>,

    /// Exit code of the command, `-1` when it has none.
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(default)]
    pub failure: Option<JobFailure>,
}

impl JobResult {
    /// Builds the synthetic result recorded for a job whose result was lost.
    pub fn lost(job: &Job, worker: Option<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id,
            build_id: job.build_id.clone(),
            test_id: job.unit.id().to_string(),
            worker,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            started_at: now,
            finished_at: now,
            failure: Some(JobFailure::Lost(reason.into())),
        }
    }

    /// Returns `true` if the command ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        self.failure.is_none() && self.exit_code == 0
    }

    /// Wall-clock time between start and finish.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
