//! Moving workers between the default pool and a build.
//!
//! Worker side, a [`WorkerAgent`] owns the worker's [`Membership`] and
//! answers control requests one at a time:
//!
//! - **provision**: rejected with "already in use" unless the worker is in
//!   the default pool. Otherwise the workspace directory is created, the
//!   setup script (if any) runs, and on success the worker joins the build
//!   queue. A failed setup leaves the worker in the default pool.
//! - **teardown**: the worker leaves the build queue, runs the teardown
//!   script (if any) and always returns to the default pool.
//!
//! Coordinator side, [`provision`] and [`teardown`] broadcast those
//! requests through a [`Broker`] and sort the replies.
//!
//! Scripts run with `BUILD_ID`, `WORKSPACE` and `DROVER_WORKER` set. A
//! script that names an existing file is run as `<shell> <file>`, anything
//! else as an inline shell command.

use std::future::Future;
use std::path::Path;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{
    Broker, BrokerResult, ControlReply, ControlRequest, DEFAULT_QUEUE, ProvisionRequest,
    TeardownRequest, build_queue_name,
};
use crate::job::BuildId;
use crate::sandbox::{Command, ExecResult, LocalSandbox, Sandbox, SandboxResult};

/// Which queue a worker consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Idle, consuming the default queue.
    Default,
    /// Serving exactly one build.
    BuildScoped(BuildId),
}

impl Membership {
    /// The queue consumed under this membership.
    pub fn queue(&self) -> String {
        match self {
            Membership::Default => DEFAULT_QUEUE.to_string(),
            Membership::BuildScoped(build_id) => build_queue_name(build_id),
        }
    }
}

/// The worker-side half of the provisioning protocol.
///
/// The membership lock is held for the whole of a request, so concurrent
/// control requests to one worker are answered strictly one after another.
#[derive(Debug)]
pub struct WorkerAgent {
    id: String,
    membership: Mutex<Membership>,
    sandbox: LocalSandbox,
}

impl WorkerAgent {
    pub fn new(id: impl Into<String>, sandbox: LocalSandbox) -> Self {
        Self {
            id: id.into(),
            membership: Mutex::new(Membership::Default),
            sandbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn membership(&self) -> Membership {
        self.membership.lock().await.clone()
    }

    /// Returns the membership, or `None` while a control request is being
    /// handled.
    pub fn try_membership(&self) -> Option<Membership> {
        self.membership.try_lock().ok().map(|m| m.clone())
    }

    /// Handles a provision request.
    ///
    /// `join` is called with the build queue name once setup succeeded; if
    /// it fails the worker stays in the default pool.
    pub async fn provision<F, Fut>(&self, request: &ProvisionRequest, join: F) -> ControlReply
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = BrokerResult<()>>,
    {
        let mut membership = self.membership.lock().await;
        if let Membership::BuildScoped(current) = &*membership {
            debug!("[{}] rejecting build {}: serving {}", self.id, request.build_id, current);
            return ControlReply::fail(format!("worker is already in use by build {}", current));
        }

        if let Some(dir) = &request.workspace_dir
            && let Err(e) = tokio::fs::create_dir_all(dir).await
        {
            return ControlReply::fail(format!(
                "failed to create workspace {}: {}",
                dir.display(),
                e
            ));
        }

        let mut output = (String::new(), String::new());
        if let Some(script) = &request.setup_script {
            match self
                .run_script(script, &request.build_id, request.workspace_dir.as_deref())
                .await
            {
                Ok(exec) if exec.success() => output = (exec.stdout, exec.stderr),
                Ok(exec) => {
                    warn!(
                        "[{}] setup script for build {} exited with {}",
                        self.id, request.build_id, exec.exit_code
                    );
                    return ControlReply::fail(format!(
                        "setup script exited with code {}",
                        exec.exit_code
                    ))
                    .with_output(exec.stdout, exec.stderr);
                }
                Err(e) => {
                    warn!("[{}] setup script could not run: {}", self.id, e);
                    return ControlReply::fail(format!("setup script could not run: {}", e));
                }
            }
        }

        if let Err(e) = join(build_queue_name(&request.build_id)).await {
            return ControlReply::fail(format!("failed to join build queue: {}", e));
        }
        *membership = Membership::BuildScoped(request.build_id.clone());
        info!("[{}] provisioned for build {}", self.id, request.build_id);
        ControlReply::ok().with_output(output.0, output.1)
    }

    /// Handles a teardown request.
    ///
    /// `leave` is called with the build queue name before the teardown
    /// script runs. The worker is back in the default pool when this
    /// returns, even if the script failed.
    pub async fn teardown<F, Fut>(&self, request: &TeardownRequest, leave: F) -> ControlReply
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut membership = self.membership.lock().await;
        match &*membership {
            Membership::BuildScoped(current) if *current == request.build_id => {}
            Membership::BuildScoped(current) => {
                return ControlReply::fail(format!(
                    "worker is serving build {}, not {}",
                    current, request.build_id
                ));
            }
            Membership::Default => {
                return ControlReply::fail(format!(
                    "worker is not provisioned for build {}",
                    request.build_id
                ));
            }
        }

        leave(build_queue_name(&request.build_id)).await;

        let reply = match &request.teardown_script {
            None => ControlReply::ok(),
            Some(script) => match self
                .run_script(script, &request.build_id, request.workspace_dir.as_deref())
                .await
            {
                Ok(exec) if exec.success() => ControlReply::ok().with_output(exec.stdout, exec.stderr),
                Ok(exec) => {
                    warn!(
                        "[{}] teardown script for build {} exited with {}",
                        self.id, request.build_id, exec.exit_code
                    );
                    ControlReply::fail(format!(
                        "teardown script exited with code {}",
                        exec.exit_code
                    ))
                    .with_output(exec.stdout, exec.stderr)
                }
                Err(e) => {
                    warn!("[{}] teardown script could not run: {}", self.id, e);
                    ControlReply::fail(format!("teardown script could not run: {}", e))
                }
            },
        };

        *membership = Membership::Default;
        info!("[{}] returned to the default pool", self.id);
        reply
    }

    async fn run_script(
        &self,
        script: &str,
        build_id: &BuildId,
        workspace_dir: Option<&Path>,
    ) -> SandboxResult<ExecResult> {
        let mut cmd = if Path::new(script).is_file() {
            Command::new(self.sandbox.shell()).arg(script)
        } else {
            Command::script(script)
        };
        cmd = cmd
            .env("BUILD_ID", build_id.as_str())
            .env("DROVER_WORKER", &self.id);
        if let Some(dir) = workspace_dir {
            cmd = cmd.env("WORKSPACE", dir.to_string_lossy());
        }
        self.sandbox.exec(&cmd).await
    }
}

/// A worker provisioned for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: String,
    /// The build queue the worker now consumes.
    pub queue: String,
}

/// Replies to a provisioning broadcast, sorted.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOutcome {
    pub accepted: Vec<WorkerHandle>,
    /// `(worker, reason)` for every candidate that refused.
    pub rejected: Vec<(String, String)>,
}

/// Asks `candidates` to join the build described by `request`.
pub async fn provision(
    broker: &dyn Broker,
    request: &ProvisionRequest,
    candidates: &[String],
) -> BrokerResult<ProvisionOutcome> {
    let queue = build_queue_name(&request.build_id);
    let replies = broker
        .broadcast(candidates, &ControlRequest::Provision(request.clone()))
        .await?;

    let mut outcome = ProvisionOutcome::default();
    for (worker, reply) in replies {
        if reply.is_ok() {
            outcome.accepted.push(WorkerHandle {
                id: worker,
                queue: queue.clone(),
            });
        } else {
            let reason = reply.reason.unwrap_or_else(|| "unknown".to_string());
            debug!("Worker {} refused build {}: {}", worker, request.build_id, reason);
            outcome.rejected.push((worker, reason));
        }
    }
    Ok(outcome)
}

/// Returns provisioned workers to the default pool.
///
/// Never fails: a worker whose teardown did not succeed is logged and
/// reported with a `fail` status.
pub async fn teardown(
    broker: &dyn Broker,
    request: &TeardownRequest,
    workers: &[WorkerHandle],
) -> Vec<(String, ControlReply)> {
    if workers.is_empty() {
        return Vec::new();
    }
    let ids: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();
    let replies = match broker
        .broadcast(&ids, &ControlRequest::Teardown(request.clone()))
        .await
    {
        Ok(replies) => replies,
        Err(e) => ids
            .into_iter()
            .map(|id| (id, ControlReply::fail(format!("teardown not delivered: {}", e))))
            .collect(),
    };

    for (worker, reply) in &replies {
        if !reply.is_ok() {
            warn!(
                "Teardown of worker {} for build {} failed: {}",
                worker,
                request.build_id,
                reply.reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    replies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent() -> WorkerAgent {
        WorkerAgent::new("w1", LocalSandbox::new("w1", &SandboxConfig::default()))
    }

    fn provision_request(build: &str, setup: Option<&str>) -> ProvisionRequest {
        ProvisionRequest {
            build_id: BuildId::new(build),
            workspace: None,
            workspace_dir: None,
            setup_script: setup.map(str::to_string),
        }
    }

    fn teardown_request(build: &str, script: Option<&str>) -> TeardownRequest {
        TeardownRequest {
            build_id: BuildId::new(build),
            workspace: None,
            workspace_dir: None,
            teardown_script: script.map(str::to_string),
        }
    }

    async fn joined(_queue: String) -> BrokerResult<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_provision_joins_build_queue() {
        let agent = agent();
        let mut joined_queue = None;
        let reply = agent
            .provision(&provision_request("b1", None), |queue| {
                joined_queue = Some(queue);
                async { Ok(()) }
            })
            .await;
        assert!(reply.is_ok());
        assert_eq!(joined_queue.as_deref(), Some("drover-b1"));
        assert_eq!(
            agent.membership().await,
            Membership::BuildScoped(BuildId::new("b1"))
        );
    }

    #[tokio::test]
    async fn test_busy_worker_rejects_already_in_use() {
        let agent = agent();
        assert!(agent.provision(&provision_request("b1", None), joined).await.is_ok());

        let reply = agent.provision(&provision_request("b2", None), joined).await;
        assert!(!reply.is_ok());
        assert!(reply.reason.unwrap().contains("already in use"));
        assert_eq!(
            agent.membership().await,
            Membership::BuildScoped(BuildId::new("b1"))
        );
    }

    #[tokio::test]
    async fn test_failed_setup_stays_in_default_pool() {
        let agent = agent();
        let reply = agent
            .provision(
                &provision_request("b1", Some("echo preparing; echo broken >&2; exit 2")),
                joined,
            )
            .await;
        assert!(!reply.is_ok());
        assert!(reply.reason.unwrap().contains("exited with code 2"));
        assert_eq!(reply.stdout.as_deref(), Some("preparing\n"));
        assert_eq!(reply.stderr.as_deref(), Some("broken\n"));
        assert_eq!(agent.membership().await, Membership::Default);
    }

    #[tokio::test]
    async fn test_failed_join_stays_in_default_pool() {
        let agent = agent();
        let reply = agent
            .provision(&provision_request("b1", None), |_| async {
                Err(crate::broker::BrokerError::Unavailable("down".into()))
            })
            .await;
        assert!(!reply.is_ok());
        assert_eq!(agent.membership().await, Membership::Default);
    }

    #[tokio::test]
    async fn test_scripts_see_build_environment() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let agent = agent();
        let request = ProvisionRequest {
            workspace_dir: Some(workspace.clone()),
            ..provision_request("b9", Some("echo \"$BUILD_ID $WORKSPACE $DROVER_WORKER\""))
        };
        let reply = agent.provision(&request, joined).await;
        assert!(reply.is_ok());
        assert!(workspace.is_dir());
        assert_eq!(
            reply.stdout.unwrap().trim_end(),
            format!("b9 {} w1", workspace.display())
        );
    }

    #[tokio::test]
    async fn test_script_file_runs_through_shell() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("setup.sh");
        std::fs::write(&script, "echo from-file\n").unwrap();
        let reply = agent()
            .provision(
                &provision_request("b1", Some(script.to_str().unwrap())),
                joined,
            )
            .await;
        assert!(reply.is_ok());
        assert_eq!(reply.stdout.as_deref(), Some("from-file\n"));
    }

    #[tokio::test]
    async fn test_teardown_always_returns_to_default_pool() {
        let agent = agent();
        agent.provision(&provision_request("b1", None), joined).await;

        let left = AtomicUsize::new(0);
        let reply = agent
            .teardown(&teardown_request("b1", Some("exit 5")), |queue| {
                assert_eq!(queue, "drover-b1");
                left.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await;
        assert!(!reply.is_ok());
        assert_eq!(left.load(Ordering::SeqCst), 1);
        assert_eq!(agent.membership().await, Membership::Default);

        // Back in the pool, so a new build can claim it.
        assert!(agent.provision(&provision_request("b2", None), joined).await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_for_other_build_is_refused() {
        let agent = agent();
        agent.provision(&provision_request("b1", None), joined).await;
        let reply = agent
            .teardown(&teardown_request("b2", None), |_| async {})
            .await;
        assert!(!reply.is_ok());
        assert_eq!(
            agent.membership().await,
            Membership::BuildScoped(BuildId::new("b1"))
        );
    }

    #[test]
    fn test_membership_queue() {
        assert_eq!(Membership::Default.queue(), "default");
        assert_eq!(
            Membership::BuildScoped(BuildId::new("x")).queue(),
            "drover-x"
        );
    }
}
