//! Worker supervision and staged pipelines on top of `courier-broker`.
//!
//! # Main types
//!
//! - [`WorkerSupervisor`]: runs one restartable consumer per registered worker.
//! - [`PipelineCoordinator`]: chains workers into a fixed sequence of stages and detects completion.
//! - [`WorkerMonitor`]: read-only view of every worker's [`ConsumerState`].
//! - [`AgentInvoker`]: boundary to the external agents that do the actual work.

/// Supervisor and pipeline settings.
pub mod config;
/// Queue-depth snapshots and drain polling.
pub mod drain;
/// Agent invocation boundary.
pub mod invoker;
/// Worker state tracking.
pub mod monitor;
/// Pipeline coordination.
pub mod pipeline;
/// Consumer supervision with restart and backoff.
pub mod supervisor;
/// Shared orchestration types.
pub mod types;
/// Worker trait and registration.
pub mod worker;

pub use config::{BackoffStrategy, PipelineConfig, SupervisorConfig};
pub use drain::{snapshot_queues, wait_for_drain};
pub use invoker::{AgentInvoker, AgentReply, InvokerWorker};
pub use monitor::WorkerMonitor;
pub use pipeline::{PipelineCoordinator, COORDINATOR_SENDER};
pub use supervisor::WorkerSupervisor;
pub use types::{
    ConsumerState, DrainReport, PipelineOutcome, PipelineRun, ShutdownReport, WorkerStatus,
};
pub use worker::{Worker, WorkerRegistration};
