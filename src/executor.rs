//! Runs one job on a worker and turns the outcome into a [`JobResult`].
//!
//! For each job the executor:
//!
//! 1. Leases one slot per configured resource kind and exports it as
//!    `DROVER_<KIND>_SLOT`.
//! 2. Runs the job's command once through its [`Sandbox`], with the job
//!    timeout applied. There are no retries at this level.
//! 3. Releases every lease, whatever the outcome.
//!
//! Every outcome, including spawn failures and timeouts, becomes a
//! `JobResult`; nothing is thrown across the job boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::ResourceConfig;
use crate::job::command::build_command;
use crate::job::{Job, JobFailure, JobResult};
use crate::lock::{LockManager, SlotLease};
use crate::sandbox::{ExecResult, Sandbox, SandboxError};

/// Environment variable carrying the leased slot of a resource kind.
pub fn slot_env_var(kind: &str) -> String {
    format!("DROVER_{}_SLOT", kind.to_ascii_uppercase())
}

/// Executes jobs for one worker.
pub struct JobExecutor<S> {
    worker: String,
    sandbox: S,
    timeout_secs: u64,
    locks: Option<Arc<LockManager>>,
    resources: Vec<ResourceConfig>,
}

impl<S: Sandbox> JobExecutor<S> {
    pub fn new(worker: impl Into<String>, sandbox: S) -> Self {
        Self {
            worker: worker.into(),
            sandbox,
            timeout_secs: 0,
            locks: None,
            resources: Vec::new(),
        }
    }

    /// Sets the per-job timeout in seconds. Zero disables it.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Leases a slot of each resource kind around every job.
    pub fn with_resources(mut self, locks: Arc<LockManager>, resources: Vec<ResourceConfig>) -> Self {
        self.locks = Some(locks);
        self.resources = resources;
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Runs the job once and reports what happened.
    pub async fn execute(&self, job: &Job) -> JobResult {
        let started_at = Utc::now();
        let mut cmd = build_command(job)
            .timeout(self.timeout_secs)
            .env("DROVER_WORKER", &self.worker);

        let leases = match self.lease_resources(job) {
            Ok(leases) => leases,
            Err(reason) => {
                warn!("[{}] {}: {}", self.worker, job.unit, reason);
                return self.failed(job, started_at, JobFailure::Infrastructure(reason));
            }
        };
        for lease in &leases {
            cmd = cmd.env(slot_env_var(lease.kind()), lease.slot().to_string());
        }

        debug!("[{}] running {}", self.worker, job.unit);
        let outcome = self.sandbox.exec(&cmd).await;
        drop(leases);

        match outcome {
            Ok(exec) => self.completed(job, exec),
            Err(SandboxError::Timeout(secs)) => {
                warn!("[{}] {} timed out after {}s", self.worker, job.unit, secs);
                self.failed(job, started_at, JobFailure::TimedOut(secs))
            }
            Err(e) => {
                warn!("[{}] {} could not run: {}", self.worker, job.unit, e);
                self.failed(job, started_at, JobFailure::Infrastructure(e.to_string()))
            }
        }
    }

    fn lease_resources(&self, job: &Job) -> Result<Vec<SlotLease>, String> {
        let Some(locks) = &self.locks else {
            return Ok(Vec::new());
        };
        // Leases acquired before a failure are released when the Vec drops.
        self.resources
            .iter()
            .map(|resource| {
                locks
                    .lease(&resource.kind, &job.build_id, resource.max_slots)
                    .map_err(|e| e.to_string())
            })
            .collect()
    }

    fn completed(&self, job: &Job, exec: ExecResult) -> JobResult {
        JobResult {
            job_id: job.id,
            build_id: job.build_id.clone(),
            test_id: job.unit.id().to_string(),
            worker: Some(self.worker.clone()),
            exit_code: exec.exit_code,
            finished_at: exec.finished_at(),
            started_at: exec.started_at,
            stdout: exec.stdout,
            stderr: exec.stderr,
            failure: None,
        }
    }

    fn failed(&self, job: &Job, started_at: DateTime<Utc>, failure: JobFailure) -> JobResult {
        JobResult {
            job_id: job.id,
            build_id: job.build_id.clone(),
            test_id: job.unit.id().to_string(),
            worker: Some(self.worker.clone()),
            exit_code: -1,
            stdout: String::new(),
            stderr: failure.to_string(),
            started_at,
            finished_at: Utc::now(),
            failure: Some(failure),
        }
    }
}
