//! The polling worker side of the queue protocol.
//!
//! A [`PullClient`] registers with `CONN`, then loops on `GET`, running
//! every `RUN <unit>` it is handed until the server answers `DONE`.
//!
//! ```text
//!  Unregistered ──CONN/READY──► Ready ──GET/RUN──► (execute) ──┐
//!                                 ▲                            │
//!                                 └────────────────────────────┘
//!                               Ready ──GET/DONE──► Done
//! ```
//!
//! Every request is retried under a bounded [`RetryPolicy`]. Transport
//! errors, closed connections, `ERR` replies and replies that make no sense
//! in the current state all count against the same budget, and each failed
//! attempt reconnects. A `GET` whose `RUN` reply is lost in transit loses
//! that unit; the server never hands it out twice.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{QueueError, QueueResult, Reply, Request, write_frame};
use crate::executor::JobExecutor;
use crate::job::{BuildId, CommandTemplate, JobId, JobResult, TestUnit};
use crate::retry::RetryPolicy;
use crate::sandbox::Sandbox;

/// Upper bound on how long the server may take to answer one request.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// What a worker did before the server told it `DONE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub executed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Unregistered,
    Ready,
}

/// What to do after a well-formed reply.
enum Step {
    Registered,
    Run(String),
    Done,
}

impl ClientState {
    fn request(self, worker: &str) -> Request {
        match self {
            ClientState::Unregistered => Request::Conn(Some(worker.to_string())),
            ClientState::Ready => Request::Get(Some(worker.to_string())),
        }
    }

    fn accept(self, reply: Reply) -> QueueResult<Step> {
        match (self, reply) {
            (ClientState::Unregistered, Reply::Ready) => Ok(Step::Registered),
            (ClientState::Ready, Reply::Run(unit)) => Ok(Step::Run(unit)),
            (ClientState::Ready, Reply::Done) => Ok(Step::Done),
            (_, Reply::Err(text)) => Err(QueueError::Rejected(text)),
            (_, reply) => Err(QueueError::Malformed(reply.to_string())),
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> QueueResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    async fn exchange(&mut self, request: &Request) -> QueueResult<Reply> {
        write_frame(&mut self.writer, &request.to_string()).await?;
        let line = tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply from server")
            })??;
        match line {
            Some(line) => Reply::parse(&line),
            None => Err(QueueError::Closed),
        }
    }
}

/// A worker that pulls units from a queue server and runs them.
pub struct PullClient<S> {
    addr: String,
    template: CommandTemplate,
    executor: JobExecutor<S>,
    build_id: BuildId,
    workspace: Option<String>,
    policy: RetryPolicy,
    results: Option<mpsc::UnboundedSender<JobResult>>,
}

impl<S: Sandbox> PullClient<S> {
    /// Creates a client that identifies itself by the executor's worker id.
    pub fn new(addr: impl Into<String>, template: CommandTemplate, executor: JobExecutor<S>) -> Self {
        Self {
            addr: addr.into(),
            template,
            executor,
            build_id: BuildId::new("queue"),
            workspace: None,
            policy: RetryPolicy::fixed(3, Duration::from_millis(500)).with_jitter(),
            results: None,
        }
    }

    /// Sets the build id and workspace substituted into commands.
    pub fn with_build(mut self, build_id: BuildId, workspace: Option<String>) -> Self {
        self.build_id = build_id;
        self.workspace = workspace;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Forwards every job result to `results`.
    pub fn with_results(mut self, results: mpsc::UnboundedSender<JobResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn worker_id(&self) -> &str {
        self.executor.worker()
    }

    /// Registers and runs units until the server answers `DONE`.
    ///
    /// # Errors
    ///
    /// `QueueError::Unreachable` once a single request has failed as many
    /// times as the retry policy allows.
    pub async fn run(&self) -> QueueResult<PullSummary> {
        let worker = self.worker_id();
        let mut connection: Option<Connection> = None;
        let mut state = ClientState::Unregistered;
        let mut summary = PullSummary::default();
        let mut next_job = 0u64;
        let mut failures = 0usize;

        loop {
            let request = state.request(worker);
            let step = match self.attempt(&mut connection, &request).await {
                Ok(reply) => state.accept(reply),
                Err(e) => Err(e),
            };

            let step = match step {
                Ok(step) => {
                    failures = 0;
                    step
                }
                Err(e) => {
                    failures += 1;
                    connection = None;
                    match &e {
                        QueueError::Malformed(line) => {
                            warn!("[{}] Malformed reply from server: {:?}", worker, line)
                        }
                        other => warn!("[{}] {} failed: {}", worker, request, other),
                    }
                    if !self.policy.allows(failures + 1) {
                        return Err(QueueError::Unreachable {
                            addr: self.addr.clone(),
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.policy.delay_after(failures)).await;
                    continue;
                }
            };

            match step {
                Step::Registered => {
                    debug!("[{}] registered with {}", worker, self.addr);
                    state = ClientState::Ready;
                }
                Step::Run(unit) => {
                    next_job += 1;
                    let result = self.run_unit(JobId(next_job), &unit).await;
                    summary.executed += 1;
                    if !result.success() {
                        summary.failed += 1;
                    }
                    if let Some(results) = &self.results {
                        // A dropped receiver only means nobody is listening.
                        let _ = results.send(result);
                    }
                }
                Step::Done => {
                    info!(
                        "[{}] done: {} units run, {} failed",
                        worker, summary.executed, summary.failed
                    );
                    return Ok(summary);
                }
            }
        }
    }

    async fn attempt(
        &self,
        connection: &mut Option<Connection>,
        request: &Request,
    ) -> QueueResult<Reply> {
        if connection.is_none() {
            *connection = Some(Connection::open(&self.addr).await?);
        }
        match connection {
            Some(conn) => conn.exchange(request).await,
            None => Err(QueueError::Closed),
        }
    }

    async fn run_unit(&self, id: JobId, unit: &str) -> JobResult {
        let job = self.template.job(
            id,
            &TestUnit::new(unit),
            &self.build_id,
            self.workspace.as_deref(),
        );
        let result = self.executor.execute(&job).await;
        let status = if result.success() { "PASS" } else { "FAIL" };
        info!(
            "[{}] {} {} ({:.2}s)",
            self.worker_id(),
            status,
            unit,
            result.duration().as_secs_f64()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BacklogOrder, SandboxConfig};
    use crate::queue::QueueServer;
    use crate::sandbox::LocalSandbox;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn client(addr: &str, worker: &str, template: &str) -> PullClient<LocalSandbox> {
        let sandbox = LocalSandbox::new(worker, &SandboxConfig::default());
        PullClient::new(
            addr,
            CommandTemplate::parse(template).unwrap(),
            JobExecutor::new(worker, sandbox),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_two_workers_drain_the_backlog() {
        let units: Vec<TestUnit> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| TestUnit::new(*id))
            .collect();
        let server = QueueServer::bind("127.0.0.1:0", units, BacklogOrder::Fifo)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let serving = tokio::spawn(server.serve(CancellationToken::new()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let w1 = client(&addr, "w1", "echo {test_id}").with_results(tx.clone());
        let w2 = client(&addr, "w2", "echo {test_id}").with_results(tx);
        let (s1, s2) = tokio::join!(w1.run(), w2.run());
        let (s1, s2) = (s1.unwrap(), s2.unwrap());
        assert_eq!(s1.executed + s2.executed, 5);
        assert_eq!(s1.failed + s2.failed, 0);

        let summary = serving.await.unwrap().unwrap();
        assert_eq!(summary.registrations, 2);

        let mut seen = Vec::new();
        while let Ok(result) = rx.try_recv() {
            assert_eq!(result.stdout.trim_end(), result.test_id);
            seen.push(result.test_id);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_failing_unit_counts_as_failed() {
        let server = QueueServer::bind(
            "127.0.0.1:0",
            vec![TestUnit::new("ok"), TestUnit::new("bad")],
            BacklogOrder::Fifo,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let serving = tokio::spawn(server.serve(CancellationToken::new()));

        let summary = client(&addr, "w1", "test {test_id} = ok")
            .run()
            .await
            .unwrap();
        assert_eq!(
            summary,
            PullSummary {
                executed: 2,
                failed: 1
            }
        );
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client(&addr, "w1", "echo {test_id}").run().await.unwrap_err();
        match err {
            QueueError::Unreachable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_replies_exhaust_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let bogus = tokio::spawn(async move {
            let mut accepted = 0;
            while accepted < 3 {
                let (mut stream, _) = listener.accept().await.unwrap();
                accepted += 1;
                let (read, mut write) = stream.split();
                let mut lines = BufReader::new(read).lines();
                if lines.next_line().await.unwrap().is_some() {
                    write.write_all(b"BOGUS\n").await.unwrap();
                }
            }
            accepted
        });

        let err = client(&addr, "w1", "echo {test_id}").run().await.unwrap_err();
        assert!(matches!(err, QueueError::Unreachable { attempts: 3, .. }));
        assert_eq!(bogus.await.unwrap(), 3);
    }

    #[test]
    fn test_state_rejects_out_of_order_replies() {
        assert!(matches!(
            ClientState::Unregistered.accept(Reply::Run("a".into())),
            Err(QueueError::Malformed(_))
        ));
        assert!(matches!(
            ClientState::Ready.accept(Reply::Ready),
            Err(QueueError::Malformed(_))
        ));
        assert!(matches!(
            ClientState::Ready.accept(Reply::Err("Unknown Command".into())),
            Err(QueueError::Rejected(_))
        ));
    }
}
