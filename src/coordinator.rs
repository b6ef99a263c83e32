//! Distribution of one build's test units across provisioned workers.
//!
//! # Execution Flow
//!
//! 1. **Acquire**: inspect the broker for idle workers in the default pool,
//!    provision up to `max_workers` of them, and retry under the
//!    provisioning [`RetryPolicy`] while none accept
//! 2. **Subscribe** to the build's result stream
//! 3. **Publish** one [`Job`] per test unit on the build queue
//! 4. **Wait** for results, handing each to the caller's callback, until
//!    every job is accounted for, the callback breaks, the stream ends,
//!    no result arrives within the result timeout, or the build is
//!    cancelled
//! 5. **Teardown** every provisioned worker, whatever happened in 2 to 4
//!
//! Jobs still outstanding when the stream ends or the result timeout fires
//! are recorded as lost. Jobs outstanding when the caller stops early or
//! the build is cancelled are counted as not run.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{
    Broker, BrokerError, ControlReply, JobEvent, ProvisionRequest, ResultStream, TeardownRequest,
    build_queue_name,
};
use crate::config::WorkspaceConfig;
use crate::job::{
    Build, BuildId, CommandTemplate, Job, JobFailure, JobId, JobResult, JobState, TemplateError,
    TestUnit,
};
use crate::lock::LockError;
use crate::provision::{self, WorkerHandle};
use crate::retry::RetryPolicy;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Failures that stop a build outright. Everything else is recorded in the
/// results.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No workers could be provisioned for build {build_id} after {attempts} attempts")]
    NoWorkers { build_id: BuildId, attempts: usize },

    #[error("Build {0} was cancelled before any worker was provisioned")]
    Cancelled(BuildId),

    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("No runner command configured for workspace {0}")]
    NoRunCommand(String),

    #[error(transparent)]
    ResourceExhausted(#[from] LockError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// What [`Coordinator::process`] observed.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// Results in arrival order, lost jobs included.
    pub results: Vec<JobResult>,

    /// Jobs that were never accounted for because the wait stopped early.
    pub not_run: usize,

    /// The build was cancelled while waiting for results.
    pub interrupted: bool,

    /// Number of workers provisioned for the build.
    pub workers: usize,

    /// Teardown replies, one per provisioned worker.
    pub teardown: Vec<(String, ControlReply)>,
}

struct Tracked {
    job: Job,
    state: JobState,
}

enum Wait {
    Event(JobEvent),
    Ended,
    TimedOut,
}

/// Runs one build's units on provisioned workers.
pub struct Coordinator<'a> {
    broker: &'a dyn Broker,
    build: Build,
    workspace: WorkspaceConfig,
    workspace_dir: Option<PathBuf>,
    provisioning: RetryPolicy,
    result_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<'a> Coordinator<'a> {
    pub fn new(broker: &'a dyn Broker, build: Build) -> Self {
        Self {
            broker,
            build,
            workspace: WorkspaceConfig::default(),
            workspace_dir: None,
            provisioning: RetryPolicy::fixed(60, Duration::from_secs(1)),
            result_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the workspace scripts and the directory exported as `WORKSPACE`.
    pub fn with_workspace(mut self, workspace: WorkspaceConfig, dir: Option<PathBuf>) -> Self {
        self.workspace = workspace;
        self.workspace_dir = dir;
        self
    }

    pub fn with_provisioning(mut self, policy: RetryPolicy) -> Self {
        self.provisioning = policy;
        self
    }

    /// Gives up on outstanding jobs after this long without any result.
    pub fn with_result_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    /// Runs every unit once and returns what came back.
    ///
    /// `on_result` sees each result as it arrives; returning
    /// `ControlFlow::Break` stops waiting for the rest. Teardown runs for
    /// every provisioned worker before this returns, on every path out of
    /// the wait.
    ///
    /// # Errors
    ///
    /// - `CoordinatorError::NoWorkers` - provisioning retries ran out
    /// - `CoordinatorError::Cancelled` - cancelled before any worker accepted
    /// - `CoordinatorError::Broker` - the broker failed; workers were still
    ///   torn down
    pub async fn process<F>(
        &self,
        units: &[TestUnit],
        template: &CommandTemplate,
        mut on_result: F,
    ) -> CoordinatorResult<ProcessOutcome>
    where
        F: FnMut(&JobResult) -> ControlFlow<()>,
    {
        if units.is_empty() {
            info!("No test units to run for build {}", self.build.id);
            return Ok(ProcessOutcome::default());
        }

        let workers = self.acquire_workers().await?;
        info!(
            "Provisioned {} workers for build {}",
            workers.len(),
            self.build.id
        );

        let outcome = self.dispatch(units, template, &mut on_result).await;

        let teardown = provision::teardown(self.broker, &self.teardown_request(), &workers).await;
        debug!("Tore down {} workers for build {}", teardown.len(), self.build.id);

        let mut outcome = outcome?;
        outcome.workers = workers.len();
        outcome.teardown = teardown;
        Ok(outcome)
    }

    async fn acquire_workers(&self) -> CoordinatorResult<Vec<WorkerHandle>> {
        let request = self.provision_request();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled(self.build.id.clone()));
            }

            let workers = self.broker.inspect().await?;
            let idle: Vec<String> = workers
                .iter()
                .filter(|w| w.in_default_pool())
                .map(|w| w.id.clone())
                .take(self.build.max_workers)
                .collect();

            if workers.is_empty() {
                info!("No queue workers available, retrying");
            } else if idle.is_empty() {
                info!("All workers are busy, retrying");
            } else {
                let outcome = provision::provision(self.broker, &request, &idle).await?;
                for (worker, reason) in &outcome.rejected {
                    warn!("Worker {} refused build {}: {}", worker, self.build.id, reason);
                }
                if !outcome.accepted.is_empty() {
                    return Ok(outcome.accepted);
                }
                info!("Failed to provision workers (busy), retrying");
            }

            if !self.provisioning.allows(attempt + 1) {
                return Err(CoordinatorError::NoWorkers {
                    build_id: self.build.id.clone(),
                    attempts: attempt,
                });
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CoordinatorError::Cancelled(self.build.id.clone()));
                }
                _ = tokio::time::sleep(self.provisioning.delay_after(attempt)) => {}
            }
        }
    }

    async fn dispatch<F>(
        &self,
        units: &[TestUnit],
        template: &CommandTemplate,
        on_result: &mut F,
    ) -> CoordinatorResult<ProcessOutcome>
    where
        F: FnMut(&JobResult) -> ControlFlow<()>,
    {
        let queue = build_queue_name(&self.build.id);
        let workspace = self
            .workspace_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().to_string());

        let mut stream = self.broker.subscribe(&self.build.id).await?;

        let mut ledger: HashMap<JobId, Tracked> = units
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let id = JobId(i as u64);
                let job = template.job(id, unit, &self.build.id, workspace.as_deref());
                (
                    id,
                    Tracked {
                        job,
                        state: JobState::Pending,
                    },
                )
            })
            .collect();

        for i in 0..units.len() {
            let id = JobId(i as u64);
            if let Some(tracked) = ledger.get_mut(&id) {
                self.broker.publish(&queue, tracked.job.clone()).await?;
                tracked.state = JobState::Dispatched;
            }
        }
        info!("Enqueued {} jobs on {}", ledger.len(), queue);

        let mut outcome = ProcessOutcome::default();
        let mut outstanding = ledger.len();

        while outstanding > 0 {
            let wait = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(
                        "Build {} interrupted with {} jobs outstanding",
                        self.build.id, outstanding
                    );
                    outcome.interrupted = true;
                    break;
                }
                wait = next_event(&mut stream, self.result_timeout) => wait,
            };

            let event = match wait {
                Wait::Event(event) => event,
                Wait::Ended => {
                    warn!(
                        "Result stream for build {} ended with {} jobs outstanding",
                        self.build.id, outstanding
                    );
                    lose_outstanding(&mut ledger, "result stream ended", &mut outcome, on_result);
                    outstanding = 0;
                    break;
                }
                Wait::TimedOut => {
                    let secs = self.result_timeout.map(|t| t.as_secs()).unwrap_or_default();
                    warn!(
                        "No result for build {} within {}s; {} jobs lost",
                        self.build.id, secs, outstanding
                    );
                    let reason = format!("no result within {}s", secs);
                    lose_outstanding(&mut ledger, &reason, &mut outcome, on_result);
                    outstanding = 0;
                    break;
                }
            };

            let result = event.into_result();
            if result.build_id != self.build.id {
                debug!("Ignoring result for foreign build {}", result.build_id);
                continue;
            }
            let Some(tracked) = ledger.get_mut(&result.job_id) else {
                debug!("Ignoring result for unknown {}", result.job_id);
                continue;
            };
            if tracked.state.is_terminal() {
                debug!("Ignoring duplicate result for {}", result.job_id);
                continue;
            }

            tracked.state = match result.failure {
                Some(JobFailure::Lost(_)) => JobState::Failed,
                _ => JobState::Completed,
            };
            outstanding -= 1;

            let flow = on_result(&result);
            outcome.results.push(result);
            if flow.is_break() {
                info!(
                    "Stopping build {} early with {} jobs outstanding",
                    self.build.id, outstanding
                );
                break;
            }
        }

        outcome.not_run = outstanding;
        Ok(outcome)
    }

    fn provision_request(&self) -> ProvisionRequest {
        ProvisionRequest {
            build_id: self.build.id.clone(),
            workspace: self.build.workspace.clone(),
            workspace_dir: self.workspace_dir.clone(),
            setup_script: self.workspace.setup.clone(),
        }
    }

    fn teardown_request(&self) -> TeardownRequest {
        TeardownRequest {
            build_id: self.build.id.clone(),
            workspace: self.build.workspace.clone(),
            workspace_dir: self.workspace_dir.clone(),
            teardown_script: self.workspace.teardown.clone(),
        }
    }
}

async fn next_event(stream: &mut ResultStream, timeout: Option<Duration>) -> Wait {
    let event = match timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(event) => event,
            Err(_) => return Wait::TimedOut,
        },
        None => stream.next().await,
    };
    match event {
        Some(event) => Wait::Event(event),
        None => Wait::Ended,
    }
}

fn lose_outstanding<F>(
    ledger: &mut HashMap<JobId, Tracked>,
    reason: &str,
    outcome: &mut ProcessOutcome,
    on_result: &mut F,
) where
    F: FnMut(&JobResult) -> ControlFlow<()>,
{
    let mut lost: Vec<&mut Tracked> = ledger
        .values_mut()
        .filter(|t| t.state == JobState::Dispatched)
        .collect();
    lost.sort_by_key(|t| t.job.id);
    for tracked in lost {
        tracked.state = JobState::Failed;
        let result = JobResult::lost(&tracked.job, None, reason);
        let _ = on_result(&result);
        outcome.results.push(result);
    }
}
