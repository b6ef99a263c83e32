//! drover: distributed test sharding.
//!
//! drover takes a list of test units, provisions idle workers for one
//! build, fans the units out to them as independent jobs and folds the
//! results into a single report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Job**: test units bound to a runner command ([`job`])
//! - **Sandbox / Executor**: run one job as a child process and capture its
//!   outcome ([`sandbox`], [`executor`])
//! - **Lock**: numbered resource slots guarded by advisory file locks
//!   ([`lock`])
//! - **Queue**: a pull-based work queue over TCP ([`queue`])
//! - **Broker / Provision**: moving workers between the default pool and a
//!   build queue ([`broker`], [`provision`])
//! - **Coordinator**: one build from provisioning to teardown
//!   ([`coordinator`])
//! - **Report**: aggregation, transcript and JUnit output ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use drover::{BuildSpec, LocalBroker, load_config, run_tests};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("drover.toml"))?;
//!     let broker = LocalBroker::new(&config);
//!     let spec = BuildSpec::new(drover::units::parse_unit_list("tests.a\ntests.b\n"));
//!     let report = run_tests(&broker, &config, &spec, CancellationToken::new()).await?;
//!     println!("{}", report.transcript());
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod job;
pub mod lock;
pub mod provision;
pub mod queue;
pub mod report;
pub mod retry;
pub mod sandbox;
pub mod units;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use broker::{Broker, LocalBroker};
pub use config::{Config, load_config};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorResult};
pub use job::{Build, BuildId, CommandTemplate, Job, JobResult, TestUnit};
pub use report::{AggregateReport, Verdict};

use lock::LockManager;
use report::Aggregator;
use retry::RetryPolicy;

/// Resource kind of the per-host build slot.
pub const BUILD_RESOURCE: &str = "build";

/// What to run for one build.
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    /// Build identifier; generated when `None`.
    pub build_id: Option<BuildId>,
    /// Workspace name selecting scripts, runner and resources.
    pub workspace: Option<String>,
    pub units: Vec<TestUnit>,
    /// Runner template overriding the configured one.
    pub run_command: Option<String>,
    /// Overrides `drover.max_workers`.
    pub max_workers: Option<usize>,
    /// Stop waiting at the first failing or erroring result.
    pub fail_fast: bool,
}

impl BuildSpec {
    pub fn new(units: Vec<TestUnit>) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }
}

/// The report of a build together with the raw job results.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub report: AggregateReport,
    pub results: Vec<JobResult>,
}

/// Runs one build and returns its aggregate report.
///
/// A build that could not execute at all (no worker ever accepted, or
/// cancelled before one did) yields a report with a `NotRun` verdict.
///
/// # Errors
///
/// - `CoordinatorError::ResourceExhausted` - no build slot was free
/// - `CoordinatorError::UnknownWorkspace` / `NoRunCommand` / `Template` -
///   the build is misconfigured
/// - `CoordinatorError::Broker` - the broker failed
pub async fn run_tests(
    broker: &dyn Broker,
    config: &Config,
    spec: &BuildSpec,
    cancel: CancellationToken,
) -> CoordinatorResult<AggregateReport> {
    run_build(broker, config, spec, cancel, |_| {})
        .await
        .map(|outcome| outcome.report)
}

/// Like [`run_tests`], also handing every result to `observer` as it
/// arrives and returning the raw results.
pub async fn run_build<F>(
    broker: &dyn Broker,
    config: &Config,
    spec: &BuildSpec,
    cancel: CancellationToken,
    mut observer: F,
) -> CoordinatorResult<BuildOutcome>
where
    F: FnMut(&JobResult),
{
    let workspace_name = spec.workspace.as_deref();
    let workspace = config
        .workspace(workspace_name)
        .ok_or_else(|| CoordinatorError::UnknownWorkspace(workspace_name.unwrap_or_default().to_string()))?;
    let run_command = spec
        .run_command
        .clone()
        .or_else(|| config.run_command(workspace_name))
        .ok_or_else(|| {
            CoordinatorError::NoRunCommand(
                workspace_name
                    .unwrap_or(config::DEFAULT_WORKSPACE)
                    .to_string(),
            )
        })?;
    let template = CommandTemplate::parse(run_command)?;

    let build = Build::new(
        spec.build_id.clone(),
        spec.workspace.clone(),
        spec.max_workers.unwrap_or(config.drover.max_workers),
    );
    let build_id = build.id.clone();

    let _build_slot = match config.drover.max_concurrent_builds {
        Some(max) => {
            let locks = Arc::new(LockManager::new(config.lock_dir()));
            let lease = locks.lease(BUILD_RESOURCE, &build_id, Some(max))?;
            info!("Build {} holds build slot {}", build_id, lease.slot());
            Some(lease)
        }
        None => None,
    };

    let workspace_dir = workspace_name.map(|name| config.workspace_dir(Some(name)));
    let coordinator = Coordinator::new(broker, build)
        .with_workspace(workspace, workspace_dir)
        .with_provisioning(RetryPolicy::from(&config.drover.provisioning))
        .with_result_timeout(config.drover.result_timeout_secs.map(Duration::from_secs))
        .with_cancel(cancel);

    info!(
        "Running {} units for build {}",
        spec.units.len(),
        build_id
    );
    let started = Instant::now();
    let mut aggregator = Aggregator::new(Some(build_id.clone()));
    let fail_fast = spec.fail_fast;

    let processed = coordinator
        .process(&spec.units, &template, |result| {
            let before = aggregator.problems();
            aggregator.add(result);
            observer(result);
            if fail_fast && aggregator.problems() > before {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await;

    match processed {
        Ok(outcome) => {
            let mut report = aggregator.finish();
            report.not_run = outcome.not_run;
            report.interrupted = outcome.interrupted || outcome.not_run > 0;
            report.duration = started.elapsed();
            Ok(BuildOutcome {
                report,
                results: outcome.results,
            })
        }
        Err(e @ (CoordinatorError::NoWorkers { .. } | CoordinatorError::Cancelled(_))) => {
            warn!("{}", e);
            let mut report = AggregateReport::not_run(Some(build_id), spec.units.len(), e.to_string());
            report.interrupted = matches!(e, CoordinatorError::Cancelled(_));
            report.duration = started.elapsed();
            Ok(BuildOutcome {
                report,
                results: Vec::new(),
            })
        }
        Err(e) => Err(e),
    }
}
