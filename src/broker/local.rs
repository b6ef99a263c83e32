//! In-process broker with local workers.
//!
//! Each worker is a [`WorkerAgent`] plus, while provisioned, a consumer task
//! that pops jobs from its build queue and runs them through a
//! [`JobExecutor`]. Queues are plain in-memory deques; results are routed to
//! whoever subscribed to the job's build.
//!
//! ```text
//!  publish ──► JobQueue("drover-<build>") ──► consumer(w1) ─┐
//!                                        └──► consumer(w2) ─┼──► Router ──► ResultStream
//!                                                           │
//!  broadcast(Provision) ──► WorkerAgent ── join ── spawns ──┘
//! ```
//!
//! Tearing a worker down purges its build queue, stops its consumer (an
//! in-flight job is killed and reported lost) and returns it to the default
//! pool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerError, BrokerResult, ControlReply, ControlRequest, JobEvent, ResultStream,
    WorkerInfo,
};
use crate::config::{Config, SandboxConfig, WorkspaceConfig};
use crate::executor::JobExecutor;
use crate::job::{BuildId, Job};
use crate::lock::LockManager;
use crate::provision::WorkerAgent;
use crate::sandbox::LocalSandbox;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A named in-memory job queue shared by the consumers of one build.
#[derive(Default)]
struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl JobQueue {
    fn push(&self, job: Job) {
        locked(&self.jobs).push_back(job);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let next = locked(&self.jobs).pop_front();
            if let Some(job) = next {
                return job;
            }
            notified.await;
        }
    }

    fn purge(&self) -> usize {
        let mut jobs = locked(&self.jobs);
        let purged = jobs.len();
        jobs.clear();
        purged
    }
}

/// Delivers job events to the subscriber of each build.
#[derive(Default)]
struct Router {
    routes: Mutex<HashMap<BuildId, tokio::sync::mpsc::UnboundedSender<JobEvent>>>,
    /// Workers consuming each build's queue.
    members: Mutex<HashMap<BuildId, usize>>,
}

impl Router {
    fn subscribe(&self, build_id: &BuildId) -> ResultStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        locked(&self.routes).insert(build_id.clone(), tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn send(&self, build_id: &BuildId, event: JobEvent) {
        match locked(&self.routes).get(build_id) {
            Some(tx) => {
                // The subscriber may already have stopped listening.
                let _ = tx.send(event);
            }
            None => debug!("No subscriber for build {}; dropping event", build_id),
        }
    }

    fn join(&self, build_id: &BuildId) {
        *locked(&self.members).entry(build_id.clone()).or_default() += 1;
    }

    /// Records that a worker stopped consuming. The route, and with it the
    /// build's result stream, ends once the last member has left.
    fn leave(&self, build_id: &BuildId) {
        let mut members = locked(&self.members);
        let remaining = match members.get_mut(build_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            members.remove(build_id);
            locked(&self.routes).remove(build_id);
        }
    }
}

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct LocalWorker {
    agent: WorkerAgent,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
}

/// A [`Broker`] whose workers run jobs as local child processes.
pub struct LocalBroker {
    workers: Vec<LocalWorker>,
    queues: Mutex<HashMap<String, Arc<JobQueue>>>,
    router: Arc<Router>,
    locks: Arc<LockManager>,
    sandbox: SandboxConfig,
    workspaces: HashMap<String, WorkspaceConfig>,
    job_timeout_secs: u64,
    shutdown: CancellationToken,
}

impl LocalBroker {
    /// Starts `drover.local_workers` idle workers.
    pub fn new(config: &Config) -> Self {
        Self::with_workers(config, config.drover.local_workers)
    }

    /// Starts `count` idle workers named `local-0`, `local-1`, ...
    pub fn with_workers(config: &Config, count: usize) -> Self {
        let workers = (0..count)
            .map(|i| {
                let id = format!("local-{}", i);
                LocalWorker {
                    agent: WorkerAgent::new(&id, LocalSandbox::new(&id, &config.sandbox)),
                    consumer: tokio::sync::Mutex::new(None),
                }
            })
            .collect();

        Self {
            workers,
            queues: Mutex::new(HashMap::new()),
            router: Arc::new(Router::default()),
            locks: Arc::new(LockManager::new(config.lock_dir())),
            sandbox: config.sandbox.clone(),
            workspaces: config.workspaces.clone(),
            job_timeout_secs: config.drover.job_timeout_secs,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.agent.id().to_string()).collect()
    }

    fn worker(&self, id: &str) -> Option<&LocalWorker> {
        self.workers.iter().find(|w| w.agent.id() == id)
    }

    async fn join(
        &self,
        worker: &LocalWorker,
        build_id: &BuildId,
        workspace: Option<&str>,
        queue: String,
    ) -> BrokerResult<()> {
        let job_queue = Arc::clone(
            locked(&self.queues)
                .entry(queue.clone())
                .or_insert_with(Default::default),
        );

        let id = worker.agent.id();
        let resources = workspace
            .and_then(|name| self.workspaces.get(name))
            .map(|ws| ws.resources.clone())
            .unwrap_or_default();
        let executor = JobExecutor::new(id, LocalSandbox::new(id, &self.sandbox))
            .with_timeout(self.job_timeout_secs)
            .with_resources(Arc::clone(&self.locks), resources);

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(consume(
            executor,
            job_queue,
            Arc::clone(&self.router),
            cancel.clone(),
        ));

        self.router.join(build_id);
        let mut slot = worker.consumer.lock().await;
        if let Some(previous) = slot.replace(Consumer { cancel, handle }) {
            previous.cancel.cancel();
        }
        debug!("[{}] consuming {}", id, queue);
        Ok(())
    }

    async fn leave(&self, worker: &LocalWorker, build_id: &BuildId, queue: String) {
        let removed = locked(&self.queues).remove(&queue);
        if let Some(job_queue) = removed {
            let purged = job_queue.purge();
            if purged > 0 {
                info!("Purged {} queued jobs from {}", purged, queue);
            }
        }

        if let Some(consumer) = worker.consumer.lock().await.take() {
            consumer.cancel.cancel();
            if let Err(e) = consumer.handle.await {
                warn!("[{}] consumer task failed: {}", worker.agent.id(), e);
            }
            self.router.leave(build_id);
        }
    }

    async fn control(&self, worker: &LocalWorker, request: &ControlRequest) -> ControlReply {
        match request {
            ControlRequest::Provision(req) => {
                worker
                    .agent
                    .provision(req, |queue| {
                        self.join(worker, &req.build_id, req.workspace.as_deref(), queue)
                    })
                    .await
            }
            ControlRequest::Teardown(req) => {
                worker
                    .agent
                    .teardown(req, |queue| self.leave(worker, &req.build_id, queue))
                    .await
            }
        }
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn consume(
    executor: JobExecutor<LocalSandbox>,
    queue: Arc<JobQueue>,
    router: Arc<Router>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.pop() => job,
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                router.send(&job.build_id.clone(), JobEvent::Lost {
                    worker: Some(executor.worker().to_string()),
                    reason: "worker torn down mid-job".to_string(),
                    job,
                });
                break;
            }
            result = executor.execute(&job) => {
                router.send(&job.build_id, JobEvent::Finished(result));
            }
        }
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn inspect(&self) -> BrokerResult<Vec<WorkerInfo>> {
        Ok(self
            .workers
            .iter()
            .map(|worker| WorkerInfo {
                id: worker.agent.id().to_string(),
                // A worker in the middle of a control request is busy.
                queues: worker
                    .agent
                    .try_membership()
                    .map(|m| vec![m.queue()])
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn broadcast(
        &self,
        destinations: &[String],
        request: &ControlRequest,
    ) -> BrokerResult<Vec<(String, ControlReply)>> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Unavailable("broker is shut down".into()));
        }

        let mut pending = FuturesUnordered::new();
        let mut replies = Vec::with_capacity(destinations.len());
        for id in destinations {
            match self.worker(id) {
                Some(worker) => pending.push(async move {
                    (worker.agent.id().to_string(), self.control(worker, request).await)
                }),
                None => replies.push((id.clone(), ControlReply::fail("unknown worker"))),
            }
        }
        while let Some(reply) = pending.next().await {
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn subscribe(&self, build_id: &BuildId) -> BrokerResult<ResultStream> {
        Ok(self.router.subscribe(build_id))
    }

    async fn publish(&self, queue: &str, job: Job) -> BrokerResult<()> {
        let job_queue = locked(&self.queues)
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        job_queue.push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ProvisionRequest, TeardownRequest, build_queue_name};
    use crate::job::{CommandTemplate, JobId, TestUnit};
    use std::time::Duration;

    fn config(lock_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.drover.lock_dir = lock_dir.to_path_buf();
        config
    }

    fn provision(build: &str) -> ControlRequest {
        ControlRequest::Provision(ProvisionRequest {
            build_id: BuildId::new(build),
            workspace: None,
            workspace_dir: None,
            setup_script: None,
        })
    }

    fn teardown(build: &str) -> ControlRequest {
        ControlRequest::Teardown(TeardownRequest {
            build_id: BuildId::new(build),
            workspace: None,
            workspace_dir: None,
            teardown_script: None,
        })
    }

    fn job(build: &str, id: u64, template: &str, unit: &str) -> Job {
        CommandTemplate::parse(template).unwrap().job(
            JobId(id),
            &TestUnit::new(unit),
            &BuildId::new(build),
            None,
        )
    }

    #[tokio::test]
    async fn test_idle_workers_are_in_default_pool() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 3);
        let workers = broker.inspect().await.unwrap();
        assert_eq!(workers.len(), 3);
        assert!(workers.iter().all(WorkerInfo::in_default_pool));
    }

    #[tokio::test]
    async fn test_provisioned_worker_runs_published_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 2);
        let ids = broker.worker_ids();

        let replies = broker.broadcast(&ids, &provision("b1")).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, r)| r.is_ok()));
        let workers = broker.inspect().await.unwrap();
        assert!(workers.iter().all(|w| w.queues == vec!["drover-b1".to_string()]));

        let mut stream = broker.subscribe(&BuildId::new("b1")).await.unwrap();
        for (i, unit) in ["a", "b", "c"].iter().enumerate() {
            broker
                .publish(&build_queue_name(&BuildId::new("b1")), job("b1", i as u64, "echo {test_id}", unit))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap()
                .unwrap();
            let result = event.into_result();
            assert!(result.success());
            seen.push(result.stdout.trim_end().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);

        let replies = broker.broadcast(&ids, &teardown("b1")).await.unwrap();
        assert!(replies.iter().all(|(_, r)| r.is_ok()));
        assert!(broker.inspect().await.unwrap().iter().all(WorkerInfo::in_default_pool));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_queue_fails() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 1);
        let err = broker
            .publish("drover-nope", job("nope", 1, "echo {test_id}", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn test_unknown_destination_gets_fail_reply() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 1);
        let replies = broker
            .broadcast(&["ghost".to_string()], &provision("b1"))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.reason.as_deref(), Some("unknown worker"));
    }

    #[tokio::test]
    async fn test_teardown_purges_and_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 1);
        let ids = broker.worker_ids();
        broker.broadcast(&ids, &provision("b1")).await.unwrap();

        let mut stream = broker.subscribe(&BuildId::new("b1")).await.unwrap();
        let queue = build_queue_name(&BuildId::new("b1"));
        broker
            .publish(&queue, job("b1", 1, "sleep 30 # {test_id}", "slow"))
            .await
            .unwrap();
        broker
            .publish(&queue, job("b1", 2, "echo {test_id}", "never"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        broker.broadcast(&ids, &teardown("b1")).await.unwrap();

        let events: Vec<JobEvent> = tokio::time::timeout(Duration::from_secs(10), stream.collect())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], JobEvent::Lost { job, .. } if job.unit.id() == "slow"));
    }

    #[tokio::test]
    async fn test_stream_stays_open_until_last_worker_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::with_workers(&config(dir.path()), 2);
        let ids = broker.worker_ids();
        broker.broadcast(&ids, &provision("b1")).await.unwrap();

        let mut stream = broker.subscribe(&BuildId::new("b1")).await.unwrap();
        let queue = build_queue_name(&BuildId::new("b1"));
        for (n, unit) in ["slow-a", "slow-b"].into_iter().enumerate() {
            broker
                .publish(&queue, job("b1", n as u64, "sleep 30 # {test_id}", unit))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        broker.broadcast(&ids[..1], &teardown("b1")).await.unwrap();
        broker.broadcast(&ids[1..], &teardown("b1")).await.unwrap();

        let events: Vec<JobEvent> = tokio::time::timeout(Duration::from_secs(10), stream.collect())
            .await
            .unwrap();
        let mut lost: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                JobEvent::Lost { job, .. } => Some(job.unit.id()),
                _ => None,
            })
            .collect();
        lost.sort();
        assert_eq!(lost, vec!["slow-a", "slow-b"]);
    }
}
