//! The queue server: one backlog, many polling workers.
//!
//! # Concurrency
//!
//! Each TCP connection gets a small task that reads request lines and
//! forwards them, together with a reply channel, to a single serving loop.
//! All backlog and registry mutations happen on that loop, one request at a
//! time, so no locking is needed and no unit is ever served twice.
//!
//! ```text
//!  conn task ─┐
//!  conn task ─┼──(Request, oneshot)──► serving loop ── owns ──► Backlog
//!  conn task ─┘                              │                 Registry
//!                                            └──► Reply
//! ```
//!
//! # Termination
//!
//! The loop ends once the backlog is empty and no registered worker is left.
//! Cancelling the server drops the remaining backlog, so every later `GET`
//! is answered `DONE`, and then waits up to the drain grace period for
//! registered workers to collect their `DONE`.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{QueueError, QueueResult, Reply, Request, write_frame};
use crate::config::BacklogOrder;
use crate::job::TestUnit;

/// How long finished connections get to flush their last reply.
const CONNECTION_LINGER: Duration = Duration::from_secs(5);

/// Statistics returned when the server stops.
#[derive(Debug, Clone, Default)]
pub struct ServeSummary {
    /// Unit ids in the order they were handed out.
    pub dispatched: Vec<String>,

    /// Number of distinct worker registrations.
    pub registrations: usize,

    /// Units dropped from the backlog because the server was cancelled.
    pub abandoned: Vec<String>,
}

/// Pending units, served according to a [`BacklogOrder`].
#[derive(Debug)]
struct Backlog {
    units: VecDeque<TestUnit>,
    order: BacklogOrder,
}

impl Backlog {
    fn pop(&mut self) -> Option<TestUnit> {
        match self.order {
            BacklogOrder::Fifo => self.units.pop_front(),
            BacklogOrder::Lifo => self.units.pop_back(),
        }
    }
}

/// Workers that registered and have not yet been told `DONE`.
#[derive(Debug, Default)]
struct Registry {
    named: HashSet<String>,
    anonymous: usize,
    total: usize,
}

impl Registry {
    fn register(&mut self, worker: Option<String>) {
        match worker {
            Some(id) => {
                if self.named.insert(id) {
                    self.total += 1;
                }
            }
            None => {
                self.anonymous += 1;
                self.total += 1;
            }
        }
    }

    fn retire(&mut self, worker: Option<&str>) {
        match worker {
            Some(id) if self.named.remove(id) => {}
            // An identified worker that never registered, or already got DONE.
            Some(_) => {}
            None => self.anonymous = self.anonymous.saturating_sub(1),
        }
    }

    fn live(&self) -> usize {
        self.named.len() + self.anonymous
    }
}

/// State owned by the serving loop.
#[derive(Debug)]
struct ServerState {
    backlog: Backlog,
    registry: Registry,
    dispatched: Vec<String>,
}

impl ServerState {
    fn new(units: Vec<TestUnit>, order: BacklogOrder) -> Self {
        Self {
            backlog: Backlog {
                units: units.into(),
                order,
            },
            registry: Registry::default(),
            dispatched: Vec::new(),
        }
    }

    fn handle(&mut self, request: Request) -> Reply {
        match request {
            Request::Conn(worker) => {
                self.registry.register(worker);
                Reply::Ready
            }
            Request::Get(worker) => match self.backlog.pop() {
                Some(unit) => {
                    debug!("Dispatching {} to {}", unit, worker.as_deref().unwrap_or("worker"));
                    self.dispatched.push(unit.id().to_string());
                    Reply::Run(unit.id().to_string())
                }
                None => {
                    self.registry.retire(worker.as_deref());
                    Reply::Done
                }
            },
            Request::Unknown(raw) => {
                debug!("Unknown request: {:?}", raw);
                Reply::Err("Unknown Command".to_string())
            }
        }
    }

    fn finished(&self) -> bool {
        self.backlog.units.is_empty() && self.registry.live() == 0
    }

    fn abandon_backlog(&mut self) -> Vec<String> {
        self.backlog
            .units
            .drain(..)
            .map(|unit| unit.id().to_string())
            .collect()
    }
}

struct Exchange {
    request: Request,
    reply: oneshot::Sender<Reply>,
}

/// A bound queue server, ready to serve.
pub struct QueueServer {
    listener: TcpListener,
    state: ServerState,
    drain_grace: Duration,
}

impl QueueServer {
    /// Binds the server and loads the backlog.
    ///
    /// Units containing a newline cannot be framed and are skipped with a
    /// warning.
    pub async fn bind(addr: &str, units: Vec<TestUnit>, order: BacklogOrder) -> QueueResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| QueueError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        let units: Vec<_> = units
            .into_iter()
            .filter(|unit| {
                let framable = !unit.id().contains(['\n', '\r']) && !unit.id().is_empty();
                if !framable {
                    warn!("Skipping test unit that cannot be framed: {:?}", unit.id());
                }
                framable
            })
            .collect();

        info!(
            "Queue server listening on {} with {} units",
            listener.local_addr()?,
            units.len()
        );

        Ok(Self {
            listener,
            state: ServerState::new(units, order),
            drain_grace: Duration::from_secs(30),
        })
    }

    /// Sets how long to wait for registered workers after cancellation.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn local_addr(&self) -> QueueResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until the backlog is drained and every registered
    /// worker has been told `DONE`.
    pub async fn serve(self, cancel: CancellationToken) -> QueueResult<ServeSummary> {
        let Self {
            listener,
            mut state,
            drain_grace,
        } = self;

        let (tx, mut rx) = mpsc::channel::<Exchange>(64);
        let mut connections = JoinSet::new();
        let mut abandoned = Vec::new();
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        while !state.finished() {
            tokio::select! {
                _ = cancel.cancelled(), if drain_deadline.is_none() => {
                    abandoned = state.abandon_backlog();
                    info!(
                        "Queue server cancelled; dropped {} pending units, draining {} workers",
                        abandoned.len(),
                        state.registry.live()
                    );
                    drain_deadline = Some(tokio::time::Instant::now() + drain_grace);
                }
                _ = sleep_until(drain_deadline) => {
                    warn!(
                        "Gave up waiting for {} registered workers",
                        state.registry.live()
                    );
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        connections.spawn(handle_connection(stream, peer, tx.clone()));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(exchange) = rx.recv() => {
                    let reply = state.handle(exchange.request);
                    // The requester may have hung up; its worker will retry.
                    let _ = exchange.reply.send(reply);
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        drop(rx);
        let _ = tokio::time::timeout(CONNECTION_LINGER, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        connections.abort_all();

        info!(
            "Queue server finished: {} units dispatched to {} workers",
            state.dispatched.len(),
            state.registry.total
        );

        Ok(ServeSummary {
            dispatched: state.dispatched,
            registrations: state.registry.total,
            abandoned,
        })
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, requests: mpsc::Sender<Exchange>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Read error from {}: {}", peer, e);
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = Exchange {
            request: Request::parse(&line),
            reply: reply_tx,
        };
        if requests.send(exchange).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };
        if let Err(e) = write_frame(&mut write, &reply.to_string()).await {
            debug!("Write error to {}: {}", peer, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(ids: &[&str]) -> Vec<TestUnit> {
        ids.iter().map(|id| TestUnit::new(*id)).collect()
    }

    #[test]
    fn test_state_fifo_dispatch_then_done() {
        let mut state = ServerState::new(units(&["a", "b"]), BacklogOrder::Fifo);
        assert_eq!(state.handle(Request::Conn(None)), Reply::Ready);
        assert_eq!(state.handle(Request::Get(None)), Reply::Run("a".into()));
        assert_eq!(state.handle(Request::Get(None)), Reply::Run("b".into()));
        assert!(!state.finished());
        assert_eq!(state.handle(Request::Get(None)), Reply::Done);
        assert!(state.finished());
    }

    #[test]
    fn test_state_lifo_serves_last_first() {
        let mut state = ServerState::new(units(&["a", "b", "c"]), BacklogOrder::Lifo);
        state.handle(Request::Conn(None));
        assert_eq!(state.handle(Request::Get(None)), Reply::Run("c".into()));
        assert_eq!(state.handle(Request::Get(None)), Reply::Run("b".into()));
    }

    #[test]
    fn test_state_never_runs_from_empty_backlog() {
        let mut state = ServerState::new(Vec::new(), BacklogOrder::Fifo);
        state.handle(Request::Conn(Some("w1".into())));
        state.handle(Request::Conn(Some("w2".into())));
        assert_eq!(state.handle(Request::Get(Some("w1".into()))), Reply::Done);
        assert_eq!(state.handle(Request::Get(Some("w1".into()))), Reply::Done);
        assert!(!state.finished());
        assert_eq!(state.handle(Request::Get(Some("w2".into()))), Reply::Done);
        assert!(state.finished());
    }

    #[test]
    fn test_retried_conn_registers_once() {
        let mut state = ServerState::new(units(&["a"]), BacklogOrder::Fifo);
        state.handle(Request::Conn(Some("w1".into())));
        state.handle(Request::Conn(Some("w1".into())));
        assert_eq!(state.registry.live(), 1);
        state.handle(Request::Get(Some("w1".into())));
        state.handle(Request::Get(Some("w1".into())));
        assert!(state.finished());
        assert_eq!(state.registry.total, 1);
    }

    #[test]
    fn test_unknown_command() {
        let mut state = ServerState::new(units(&["a"]), BacklogOrder::Fifo);
        assert_eq!(
            state.handle(Request::parse("PING")),
            Reply::Err("Unknown Command".into())
        );
        assert_eq!(state.backlog.units.len(), 1);
    }

    #[test]
    fn test_each_unit_dispatched_once() {
        let ids: Vec<String> = (0..50).map(|i| format!("t{}", i)).collect();
        let mut state = ServerState::new(
            ids.iter().map(|id| TestUnit::new(id.as_str())).collect(),
            BacklogOrder::Fifo,
        );
        for w in 0..3 {
            state.handle(Request::Conn(Some(format!("w{}", w))));
        }
        let mut w = 0;
        while !state.finished() {
            state.handle(Request::Get(Some(format!("w{}", w % 3))));
            w += 1;
        }
        let mut dispatched = state.dispatched.clone();
        dispatched.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(dispatched, expected);
    }

    async fn exchange(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: &mut tokio::net::tcp::OwnedWriteHalf,
        request: &str,
    ) -> String {
        write_frame(write, request).await.unwrap();
        lines.next_line().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let server = QueueServer::bind("127.0.0.1:0", units(&["x", "y"]), BacklogOrder::Fifo)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.serve(CancellationToken::new()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        assert_eq!(exchange(&mut lines, &mut write, "CONN").await, "READY");
        assert_eq!(exchange(&mut lines, &mut write, "BOGUS").await, "ERR Unknown Command");
        assert_eq!(exchange(&mut lines, &mut write, "GET").await, "RUN x");
        assert_eq!(exchange(&mut lines, &mut write, "GET").await, "RUN y");
        assert_eq!(exchange(&mut lines, &mut write, "GET").await, "DONE");
        drop(write);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dispatched, vec!["x", "y"]);
        assert_eq!(summary.registrations, 1);
        assert!(summary.abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_drains_backlog() {
        let server = QueueServer::bind("127.0.0.1:0", units(&["x", "y", "z"]), BacklogOrder::Fifo)
            .await
            .unwrap()
            .with_drain_grace(Duration::from_secs(5));
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.serve(cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(exchange(&mut lines, &mut write, "CONN w1").await, "READY");
        assert_eq!(exchange(&mut lines, &mut write, "GET w1").await, "RUN x");

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exchange(&mut lines, &mut write, "GET w1").await, "DONE");
        drop(write);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dispatched, vec!["x"]);
        assert_eq!(summary.abandoned, vec!["y", "z"]);
    }

    #[tokio::test]
    async fn test_cancel_gives_up_on_silent_workers() {
        let server = QueueServer::bind("127.0.0.1:0", units(&["x"]), BacklogOrder::Fifo)
            .await
            .unwrap()
            .with_drain_grace(Duration::from_millis(100));
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.serve(cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(exchange(&mut lines, &mut write, "CONN").await, "READY");
        drop(write);

        cancel.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.dispatched.is_empty());
    }
}
