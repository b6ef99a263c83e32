//! Queue-pull dispatch of test units to polling workers.
//!
//! A [`server::QueueServer`] holds the backlog of one discovery run and hands
//! units out one at a time; any number of [`client::PullClient`]s poll it,
//! run what they are given and come back for more.
//!
//! # Wire Protocol
//!
//! Line-delimited request/reply over TCP. Every request line gets exactly
//! one reply line, in order, on the same connection.
//!
//! | Request | Condition | Reply |
//! |---------|-----------|-------|
//! | `CONN [worker-id]` | | `READY` |
//! | `GET [worker-id]` | backlog non-empty | `RUN <test-unit-id>` |
//! | `GET [worker-id]` | backlog empty | `DONE` |
//! | anything else | | `ERR Unknown Command` |
//!
//! The optional worker id makes registration idempotent: a `CONN` that is
//! retried after a lost reply registers the worker only once.

pub mod client;
pub mod server;

use std::fmt;

pub use client::{PullClient, PullSummary};
pub use server::{QueueServer, ServeSummary};

/// Default address of the queue server.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8011";

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A reply line that is not part of the protocol, or not valid in the
    /// client's current state.
    #[error("Malformed reply from server: {0:?}")]
    Malformed(String),

    /// The server answered `ERR`.
    #[error("Server rejected request: {0}")]
    Rejected(String),

    /// The peer closed the connection mid-exchange.
    #[error("Connection closed by peer")]
    Closed,

    /// The pull client exhausted its retries.
    #[error("Queue server {addr} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        addr: String,
        attempts: usize,
        last_error: String,
    },

    #[error("Failed to bind queue server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register as an available worker.
    Conn(Option<String>),
    /// Ask for the next unit.
    Get(Option<String>),
    /// Anything the server does not understand.
    Unknown(String),
}

impl Request {
    /// Parses one request line. Never fails; unknown input maps to
    /// [`Request::Unknown`].
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, Some(rest.trim()).filter(|r| !r.is_empty())),
            None => (line, None),
        };
        let worker = rest.map(str::to_string);
        match verb {
            "CONN" => Request::Conn(worker),
            "GET" => Request::Get(worker),
            _ => Request::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Conn(None) => f.write_str("CONN"),
            Request::Conn(Some(id)) => write!(f, "CONN {}", id),
            Request::Get(None) => f.write_str("GET"),
            Request::Get(Some(id)) => write!(f, "GET {}", id),
            Request::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// A reply sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ready,
    Run(String),
    Done,
    Err(String),
}

impl Reply {
    /// Parses one reply line.
    ///
    /// # Errors
    ///
    /// `QueueError::Malformed` for anything outside the protocol, including
    /// `RUN` without a unit id.
    pub fn parse(line: &str) -> QueueResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.split_once(' ') {
            None if line == "READY" => Ok(Reply::Ready),
            None if line == "DONE" => Ok(Reply::Done),
            None if line == "ERR" => Ok(Reply::Err(String::new())),
            Some(("RUN", id)) if !id.is_empty() => Ok(Reply::Run(id.to_string())),
            Some(("ERR", text)) => Ok(Reply::Err(text.to_string())),
            _ => Err(QueueError::Malformed(line.to_string())),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready => f.write_str("READY"),
            Reply::Run(id) => write!(f, "RUN {}", id),
            Reply::Done => f.write_str("DONE"),
            Reply::Err(text) => write!(f, "ERR {}", text),
        }
    }
}

/// Writes one frame followed by a newline.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
