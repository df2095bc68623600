use chrono::{DateTime, Utc};
use courier_broker::QueueStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of one supervised consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Connecting and subscribing.
    Starting,
    /// Consuming its queue.
    Running,
    /// Waiting before the next restart.
    Backoff,
    /// Gave up after too many consecutive failures.
    Failed,
    /// Cancelled by its owner.
    Stopped,
}

impl WorkerStatus {
    /// Whether the worker task has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Failed | WorkerStatus::Stopped)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Backoff => write!(f, "backoff"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of a supervised consumer, published by the task that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Worker name.
    pub worker: String,
    /// Consecutive failed sessions; reset once a session reaches `Running`.
    pub attempt_count: u32,
    /// Sessions restarted over the worker's lifetime.
    pub restarts: u32,
    /// Cause of the most recent failed session.
    pub last_error: Option<String>,
    /// Current lifecycle status.
    pub status: WorkerStatus,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
}

impl ConsumerState {
    pub(crate) fn starting(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            attempt_count: 0,
            restarts: 0,
            last_error: None,
            status: WorkerStatus::Starting,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of `WorkerSupervisor::shutdown`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Workers that stopped within the timeout.
    pub stopped: Vec<String>,
    /// Workers that had to be aborted.
    pub abandoned: Vec<String>,
}

/// Tracking record for one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Shared by every envelope of this run.
    pub correlation_id: String,
    /// Number of stages whose result has been observed.
    pub stage_index: usize,
    /// When the initial input was published.
    pub started_at: DateTime<Utc>,
    /// Set once the terminal stage's result is observed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub(crate) fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            stage_index: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the terminal stage finished.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// A finished pipeline run and the terminal stage's output.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// The completed run.
    pub run: PipelineRun,
    /// The terminal stage's result.
    pub output: courier_core::Envelope,
}

impl PipelineOutcome {
    /// The terminal payload as text.
    pub fn output_text(&self) -> String {
        self.output.payload_str().into_owned()
    }
}

/// Result of `PipelineCoordinator::wait_until_drained`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Whether every stage queue reached zero.
    pub drained: bool,
    /// Snapshots taken.
    pub polls: u32,
    /// The last snapshot.
    pub snapshot: BTreeMap<String, QueueStats>,
}

impl DrainReport {
    /// Messages still waiting across all queues in the last snapshot.
    pub fn pending(&self) -> u64 {
        self.snapshot
            .values()
            .map(|s| u64::from(s.message_count))
            .sum()
    }
}
