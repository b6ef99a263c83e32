//! drover CLI - distributed test sharding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use drover::config::{self, BacklogOrder, Config};
use drover::executor::JobExecutor;
use drover::job::{BuildId, CommandTemplate, JobResult, TestUnit};
use drover::lock::LockManager;
use drover::queue::{PullClient, QueueServer};
use drover::report::{self, AggregateReport, ProgressReporter, junit};
use drover::retry::RetryPolicy;
use drover::sandbox::LocalSandbox;
use drover::units::{self, UnitFilter};
use drover::{BuildSpec, LocalBroker};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Distributed test sharding and aggregation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "drover.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build on in-process workers
    Run {
        /// Test units to run (defaults to --units-file or discover_command)
        units: Vec<String>,

        /// File with one test unit per line
        #[arg(long)]
        units_file: Option<PathBuf>,

        /// Workspace selecting scripts, runner and resources
        #[arg(short, long)]
        workspace: Option<String>,

        /// Build identifier (generated when omitted)
        #[arg(long)]
        build_id: Option<String>,

        /// Override maximum workers provisioned for the build
        #[arg(short = 'p', long)]
        max_workers: Option<usize>,

        /// Override the number of local workers started
        #[arg(long)]
        workers: Option<usize>,

        /// Runner command template, e.g. "python -m unittest {test_id}"
        #[arg(long)]
        run_command: Option<String>,

        /// Stop at the first failing result
        #[arg(long)]
        fail_fast: bool,

        /// Only run units matching this regex (repeatable)
        #[arg(long)]
        include: Vec<String>,

        /// Skip units matching this regex (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Serve test units to pull workers
    Serve {
        /// Test units to serve (defaults to --units-file or discover_command)
        units: Vec<String>,

        /// File with one test unit per line
        #[arg(long)]
        units_file: Option<PathBuf>,

        /// Address to bind
        #[arg(short, long)]
        address: Option<String>,

        /// Serve the most recently listed unit first
        #[arg(long)]
        lifo: bool,
    },

    /// Pull and run test units from a queue server
    Work {
        /// Queue server address
        #[arg(short, long)]
        address: Option<String>,

        /// Worker identifier sent with CONN and GET
        #[arg(long)]
        worker_id: Option<String>,

        /// Workspace selecting runner and resources
        #[arg(short, long)]
        workspace: Option<String>,

        /// Build identifier substituted into commands
        #[arg(long)]
        build_id: Option<String>,

        /// Runner command template
        #[arg(long)]
        run_command: Option<String>,

        /// Append each job result as a JSON line to this file
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Fold JSON-lines result files into a report
    Aggregate {
        /// Result files written by `drover work --results`
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Default runner command template
        #[arg(long, default_value = "python -m unittest {test_id}")]
        run_command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            units,
            units_file,
            workspace,
            build_id,
            max_workers,
            workers,
            run_command,
            fail_fast,
            include,
            exclude,
            junit,
        } => {
            let config = load_or_default(&cli.config)?;
            let filter = UnitFilter::new(&include, &exclude).context("Invalid --include/--exclude pattern")?;
            let units = filter.apply(load_units(&config, units, units_file.as_deref()).await?);
            let spec = BuildSpec {
                build_id: build_id.map(BuildId::new),
                workspace,
                units,
                run_command,
                max_workers,
                fail_fast,
            };
            run_build(config, spec, workers, junit, cli.verbose).await
        }
        Commands::Serve {
            units,
            units_file,
            address,
            lifo,
        } => {
            let config = load_or_default(&cli.config)?;
            let units = load_units(&config, units, units_file.as_deref()).await?;
            serve(&config, units, address, lifo).await
        }
        Commands::Work {
            address,
            worker_id,
            workspace,
            build_id,
            run_command,
            results,
        } => {
            let config = load_or_default(&cli.config)?;
            work(&config, address, worker_id, workspace, build_id, run_command, results).await
        }
        Commands::Aggregate { files, junit } => aggregate(&files, junit),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { run_command } => init_config(&run_command),
    }
}

/// Loads the config file, falling back to defaults when the default path
/// does not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new("drover.toml") {
        info!("No drover.toml found, using default configuration");
        return Ok(Config::default());
    }
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

async fn load_units(
    config: &Config,
    ids: Vec<String>,
    units_file: Option<&Path>,
) -> Result<Vec<TestUnit>> {
    if !ids.is_empty() {
        return Ok(units::parse_unit_list(&ids.join("\n")));
    }
    if let Some(path) = units_file {
        return units::read_units_file(path);
    }
    match &config.drover.discover_command {
        Some(command) => {
            units::discover(
                command,
                &config.sandbox.shell,
                config.sandbox.working_dir.as_deref(),
            )
            .await
        }
        None => bail!("No test units given: pass units, --units-file, or set drover.discover_command"),
    }
}

/// Cancels the returned token on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_build(
    config: Config,
    spec: BuildSpec,
    workers: Option<usize>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let broker = LocalBroker::with_workers(&config, workers.unwrap_or(config.drover.local_workers));
    let cancel = interrupt_token();

    let progress = ProgressReporter::new(verbose);
    progress.start(spec.units.len());
    let outcome = drover::run_build(&broker, &config, &spec, cancel, |result| {
        progress.on_result(result)
    })
    .await;
    progress.finish();
    let outcome = outcome?;

    println!();
    print!("{}", outcome.report.transcript());
    report::print_summary(&outcome.report);
    write_reports(&config, &outcome.report, &outcome.results, junit_path)?;

    std::process::exit(outcome.report.exit_code());
}

fn write_reports(
    config: &Config,
    report: &AggregateReport,
    results: &[JobResult],
    junit_override: Option<PathBuf>,
) -> Result<()> {
    if config.report.junit || junit_override.is_some() {
        let path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        junit::write_junit(report, results, &path)?;
    }
    if let Some(dir) = &config.report.xunit_dir {
        let written = junit::write_job_reports(dir, results)?;
        info!("Wrote {} per-job reports to {}", written, dir.display());
    }
    Ok(())
}

async fn serve(config: &Config, units: Vec<TestUnit>, address: Option<String>, lifo: bool) -> Result<()> {
    let address = address.unwrap_or_else(|| config.queue.address.clone());
    let order = if lifo {
        BacklogOrder::Lifo
    } else {
        config.queue.order
    };

    let server = QueueServer::bind(&address, units, order)
        .await?
        .with_drain_grace(Duration::from_secs(config.queue.drain_grace_secs));
    let summary = server.serve(interrupt_token()).await?;

    info!(
        "Served {} units to {} workers",
        summary.dispatched.len(),
        summary.registrations
    );
    if !summary.abandoned.is_empty() {
        warn!("{} units were never handed out", summary.abandoned.len());
        std::process::exit(1);
    }
    Ok(())
}

async fn work(
    config: &Config,
    address: Option<String>,
    worker_id: Option<String>,
    workspace: Option<String>,
    build_id: Option<String>,
    run_command: Option<String>,
    results_path: Option<PathBuf>,
) -> Result<()> {
    let address = address.unwrap_or_else(|| config.queue.address.clone());
    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let ws = config
        .workspace(workspace.as_deref())
        .with_context(|| format!("Unknown workspace: {}", workspace.as_deref().unwrap_or_default()))?;
    let template = run_command
        .or_else(|| config.run_command(workspace.as_deref()))
        .context("No runner command: pass --run-command or set drover.run_command")?;
    let template = CommandTemplate::parse(template)?;

    let executor = JobExecutor::new(&worker_id, LocalSandbox::new(&worker_id, &config.sandbox))
        .with_timeout(config.drover.job_timeout_secs)
        .with_resources(Arc::new(LockManager::new(config.lock_dir())), ws.resources);

    let build_id = build_id.map(BuildId::new).unwrap_or_else(BuildId::generate);
    let mut client = PullClient::new(&address, template, executor)
        .with_build(build_id, workspace.as_ref().map(|name| {
            config.workspace_dir(Some(name.as_str())).to_string_lossy().to_string()
        }))
        .with_retry_policy(RetryPolicy::from(&config.queue.retry));

    let writer = match results_path {
        Some(path) => {
            let (tx, rx) = mpsc::unbounded_channel();
            client = client.with_results(tx);
            Some(tokio::spawn(write_results(path, rx)))
        }
        None => None,
    };

    let outcome = client.run().await;
    drop(client);
    if let Some(writer) = writer {
        writer.await.context("Result writer task failed")??;
    }

    let summary = outcome?;
    if summary.failed > 0 {
        info!("{} of {} units failed", summary.failed, summary.executed);
    }
    Ok(())
}

async fn write_results(path: PathBuf, mut rx: mpsc::UnboundedReceiver<JobResult>) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    while let Some(result) = rx.recv().await {
        let mut line = serde_json::to_string(&result)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
    }
    file.flush().await?;
    Ok(())
}

fn aggregate(files: &[PathBuf], junit_path: Option<PathBuf>) -> Result<()> {
    let mut results = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let result: JobResult = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid job result", path.display(), n + 1))?;
            results.push(result);
        }
    }

    let report = report::fold(&results);
    print!("{}", report.transcript());
    report::print_summary(&report);
    if let Some(path) = junit_path {
        junit::write_junit(&report, &results, &path)?;
    }

    std::process::exit(report.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max workers: {}", config.drover.max_workers);
            println!("  Local workers: {}", config.drover.local_workers);
            println!("  Job timeout: {}s", config.drover.job_timeout_secs);
            println!("  Lock dir: {}", config.lock_dir().display());
            println!(
                "  Run command: {}",
                config.drover.run_command.as_deref().unwrap_or("(none)")
            );
            println!("  Queue address: {}", config.queue.address);

            let mut names: Vec<_> = config.workspaces.keys().collect();
            names.sort();
            for name in names {
                println!("  Workspace: {}", name);
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(run_command: &str) -> Result<()> {
    CommandTemplate::parse(run_command).context("Invalid --run-command")?;

    let config = format!(
        r#"# drover configuration file

[drover]
max_workers = 4
local_workers = 4
job_timeout_secs = 900
run_command = "{}"
# discover_command = "python -m unittest discover --collect-only"
lock_dir = "/var/tmp"

[drover.provisioning]
max_attempts = 60
delay_ms = 1000

[sandbox]
shell = "/bin/sh"

# [workspaces.api]
# setup = "scripts/setup.sh"
# teardown = "scripts/teardown.sh"
# resources = [{{ kind = "db", max_slots = 4 }}]

[queue]
address = "0.0.0.0:8011"
order = "fifo"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#,
        run_command.replace('\\', "\\\\").replace('"', "\\\"")
    );

    let path = PathBuf::from("drover.toml");
    if path.exists() {
        eprintln!("drover.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created drover.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  drover run");

    Ok(())
}
