//! The message broker boundary.
//!
//! Drover does not implement a general-purpose broker. It needs four things
//! from one, captured by the [`Broker`] trait:
//!
//! - **inspect**: which workers exist and which queues they consume
//! - **broadcast**: a control request fanned out to named workers, with one
//!   reply collected per destination
//! - **subscribe**: a stream of job events for one build
//! - **publish**: a job placed on a named queue
//!
//! Idle workers consume the [`DEFAULT_QUEUE`]. A provisioned worker consumes
//! only its build's queue, named by [`build_queue_name`], until teardown.
//!
//! [`LocalBroker`] runs the workers in-process. A deployment backed by an
//! external broker implements the same trait.

pub mod local;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::job::{BuildId, Job, JobResult};

pub use local::LocalBroker;

/// Queue consumed by workers that are not serving a build.
pub const DEFAULT_QUEUE: &str = "default";

/// Prefix of build-scoped queue names.
pub const BUILD_QUEUE_PREFIX: &str = "drover";

/// The queue a build's jobs are published on.
pub fn build_queue_name(build_id: &BuildId) -> String {
    format!("{}-{}", BUILD_QUEUE_PREFIX, build_id)
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What `inspect` reports about one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub queues: Vec<String>,
}

impl WorkerInfo {
    /// Returns `true` if the worker is idle in the default pool.
    pub fn in_default_pool(&self) -> bool {
        self.queues.iter().any(|q| q == DEFAULT_QUEUE)
    }
}

/// Asks a worker to prepare for a build and join its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub build_id: BuildId,
    /// Workspace name; selects the per-job resource kinds.
    pub workspace: Option<String>,
    /// Workspace directory, exported to scripts as `WORKSPACE`.
    pub workspace_dir: Option<PathBuf>,
    pub setup_script: Option<String>,
}

/// Asks a worker to leave a build and rejoin the default pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownRequest {
    pub build_id: BuildId,
    pub workspace: Option<String>,
    pub workspace_dir: Option<PathBuf>,
    pub teardown_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Provision(ProvisionRequest),
    Teardown(TeardownRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Fail,
}

/// One worker's answer to a control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            reason: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Fail,
            reason: Some(reason.into()),
            ..Self::ok()
        }
    }

    /// Attaches captured script output.
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// Something that happened to a published job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job ran to completion, successfully or not.
    Finished(JobResult),
    /// The worker holding the job went away before reporting.
    Lost {
        job: Job,
        worker: Option<String>,
        reason: String,
    },
}

impl JobEvent {
    /// Converts the event into the result recorded for its job.
    pub fn into_result(self) -> JobResult {
        match self {
            JobEvent::Finished(result) => result,
            JobEvent::Lost {
                job,
                worker,
                reason,
            } => JobResult::lost(&job, worker, reason),
        }
    }
}

/// Job events for one build, in completion order.
pub type ResultStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// A message broker with workers attached.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Lists the known workers and the queues they consume.
    async fn inspect(&self) -> BrokerResult<Vec<WorkerInfo>>;

    /// Sends `request` to each named worker and collects their replies.
    ///
    /// Replies arrive in completion order, not in `destinations` order.
    /// A destination that cannot be reached yields a `fail` reply.
    async fn broadcast(
        &self,
        destinations: &[String],
        request: &ControlRequest,
    ) -> BrokerResult<Vec<(String, ControlReply)>>;

    /// Opens the event stream for a build. Subscribe before publishing.
    async fn subscribe(&self, build_id: &BuildId) -> BrokerResult<ResultStream>;

    /// Places a job on a queue.
    async fn publish(&self, queue: &str, job: Job) -> BrokerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CommandTemplate, JobFailure, JobId, TestUnit};

    #[test]
    fn test_build_queue_name_is_deterministic() {
        let id = BuildId::new("abc123");
        assert_eq!(build_queue_name(&id), "drover-abc123");
        assert_eq!(build_queue_name(&id), build_queue_name(&id.clone()));
    }

    #[test]
    fn test_in_default_pool() {
        let idle = WorkerInfo {
            id: "w1".into(),
            queues: vec![DEFAULT_QUEUE.into()],
        };
        let busy = WorkerInfo {
            id: "w2".into(),
            queues: vec!["drover-b1".into()],
        };
        assert!(idle.in_default_pool());
        assert!(!busy.in_default_pool());
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = ControlReply::fail("worker is already in use");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["reason"], "worker is already in use");
        assert!(json.get("stdout").is_none());

        let parsed: ControlReply = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.reason, None);
    }

    #[test]
    fn test_request_wire_format() {
        let request = ControlRequest::Provision(ProvisionRequest {
            build_id: BuildId::new("b1"),
            workspace: Some("api".into()),
            workspace_dir: None,
            setup_script: None,
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "provision");
        assert_eq!(json["build_id"], "b1");
        let back: ControlRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_lost_event_becomes_lost_result() {
        let job = CommandTemplate::parse("run {test_id}").unwrap().job(
            JobId(7),
            &TestUnit::new("t"),
            &BuildId::new("b1"),
            None,
        );
        let result = JobEvent::Lost {
            job,
            worker: Some("w1".into()),
            reason: "worker exited".into(),
        }
        .into_result();
        assert_eq!(result.job_id, JobId(7));
        assert_eq!(
            result.failure,
            Some(JobFailure::Lost("worker exited".into()))
        );
    }
}
