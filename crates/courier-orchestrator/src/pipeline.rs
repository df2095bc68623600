//! Fixed sequential pipelines over supervised workers.
//!
//! Stage `i`'s result is forwarded to stage `i + 1`'s queue with the run's
//! correlation id. The coordinator watches each stage complete and reports
//! the terminal output, or a timeout once a run stops advancing.

use crate::config::PipelineConfig;
use crate::drain;
use crate::invoker::{AgentInvoker, InvokerWorker};
use crate::supervisor::WorkerSupervisor;
use crate::types::{DrainReport, PipelineOutcome, PipelineRun};
use crate::worker::{Worker, WorkerRegistration};
use async_trait::async_trait;
use chrono::Utc;
use courier_broker::{BrokerConnection, ConnectionConfig, Publisher, Queue, QueueStats, Transport};
use courier_core::{
    CorrelationId, CourierError, CourierResult, Envelope, HandlerError, QueueName,
    META_HANDOFF_FROM, META_STAGE_INDEX,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Sender name stamped on the envelope that starts a run.
pub const COORDINATOR_SENDER: &str = "coordinator";

#[derive(Debug)]
struct StageEvent {
    stage_index: usize,
    output: Envelope,
}

type RunTable = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<StageEvent>>>>;

/// Drives runs through `[stage_1, …, stage_n]`.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    stages: Vec<QueueName>,
    connection: Arc<BrokerConnection>,
    publisher: Publisher,
    supervisor: Arc<WorkerSupervisor>,
    invoker: Arc<dyn AgentInvoker>,
    runs: RunTable,
}

impl PipelineCoordinator {
    /// Build a coordinator. Nothing touches the broker until [`start`](Self::start).
    pub fn new(
        connection: ConnectionConfig,
        transport: Arc<dyn Transport>,
        supervisor: Arc<WorkerSupervisor>,
        invoker: Arc<dyn AgentInvoker>,
        config: PipelineConfig,
    ) -> CourierResult<Self> {
        let stages = config.stage_queues()?;
        let connection = Arc::new(BrokerConnection::new(connection, transport));
        Ok(Self {
            config,
            stages,
            publisher: Publisher::new(Arc::clone(&connection)),
            connection,
            supervisor,
            invoker,
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Stage queues in execution order.
    pub fn stages(&self) -> &[QueueName] {
        &self.stages
    }

    /// Connect, declare every stage queue durable and register one worker per stage.
    pub async fn start(&self) -> CourierResult<()> {
        self.connection.connect().await?;
        for queue in &self.stages {
            Queue::declare(&self.connection, queue, true).await?;
        }
        for (position, queue) in self.stages.iter().enumerate() {
            let stage = StageWorker {
                inner: InvokerWorker::new(queue.as_str(), Arc::clone(&self.invoker))
                    .at_stage(position + 1),
                stage_index: position + 1,
                runs: Arc::clone(&self.runs),
            };
            let mut registration = WorkerRegistration::new(queue.as_str(), Arc::new(stage));
            if let Some(next) = self.stages.get(position + 1) {
                registration = registration.forward_to(next.clone());
            }
            self.supervisor.register(registration).await?;
        }
        info!(
            stages = ?self.config.stages,
            stall_timeout_secs = self.config.stall_timeout_secs,
            "Pipeline started"
        );
        Ok(())
    }

    /// Run `input` through every stage and return the terminal output.
    pub async fn run(&self, input: impl Into<String>) -> CourierResult<PipelineOutcome> {
        self.run_with(input, |_| {}).await
    }

    /// Like [`run`](Self::run), invoking `on_complete` when the terminal
    /// stage's result is observed.
    ///
    /// Fails with [`CourierError::PipelineTimeout`] if no stage completes for
    /// longer than the stall timeout. Abandoned runs are not retried.
    pub async fn run_with<F>(
        &self,
        input: impl Into<String>,
        on_complete: F,
    ) -> CourierResult<PipelineOutcome>
    where
        F: FnOnce(&PipelineOutcome) + Send,
    {
        let correlation_id = CorrelationId::generate();
        let mut run = PipelineRun::new(correlation_id.as_str());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        self.runs
            .lock()
            .insert(run.correlation_id.clone(), events_tx);
        let _registered = RunRegistration {
            runs: Arc::clone(&self.runs),
            correlation_id: run.correlation_id.clone(),
        };

        let envelope = Envelope::text(input, COORDINATOR_SENDER)
            .with_correlation_id(correlation_id.as_str())
            .with_metadata(META_STAGE_INDEX, "0");
        self.publisher.publish(&self.stages[0], &envelope).await?;
        info!(
            correlation_id = %run.correlation_id,
            first_stage = %self.stages[0],
            "Pipeline run started"
        );

        let stall = self.config.stall_timeout();
        let total = self.stages.len();
        let mut deadline = Instant::now() + stall;
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(CourierError::Shutdown(format!(
                        "pipeline run {} lost its event channel",
                        run.correlation_id
                    )))
                }
                Err(_) => {
                    error!(
                        correlation_id = %run.correlation_id,
                        stage_index = run.stage_index,
                        stalled_for_ms = stall.as_millis() as u64,
                        "Pipeline run stalled, abandoning"
                    );
                    return Err(CourierError::PipelineTimeout {
                        correlation_id: run.correlation_id,
                        stage_index: run.stage_index,
                        stalled_for: stall,
                    });
                }
            };

            // Redeliveries can report a stage twice.
            if event.stage_index <= run.stage_index {
                debug!(
                    correlation_id = %run.correlation_id,
                    stage_index = event.stage_index,
                    "Duplicate stage completion ignored"
                );
                continue;
            }
            run.stage_index = event.stage_index;
            deadline = Instant::now() + stall;
            info!(
                correlation_id = %run.correlation_id,
                stage_index = run.stage_index,
                stages = total,
                sender = event.output.sender(),
                "Pipeline run advanced"
            );

            if run.stage_index >= total {
                run.completed_at = Some(Utc::now());
                let outcome = PipelineOutcome {
                    run,
                    output: event.output,
                };
                on_complete(&outcome);
                info!(correlation_id = %outcome.run.correlation_id, "Pipeline run complete");
                return Ok(outcome);
            }
        }
    }

    /// Publish `envelope` from worker `from` straight to worker `to`'s queue,
    /// keeping its correlation id.
    pub async fn handoff(&self, from: &str, to: &str, envelope: Envelope) -> CourierResult<()> {
        for name in [from, to] {
            if self.supervisor.status(name).await.is_none() {
                return Err(CourierError::UnknownWorker(name.to_string()));
            }
        }
        let target = QueueName::new(to)?;
        let handed = envelope
            .with_sender(from)
            .with_metadata(META_HANDOFF_FROM, from);
        self.publisher.publish(&target, &handed).await?;
        info!(
            from,
            to,
            correlation_id = handed.correlation_id().unwrap_or("-"),
            "Handoff published"
        );
        Ok(())
    }

    /// Point-in-time counters for every stage queue. Racy; for operators and tests.
    pub async fn debug_queues(&self) -> CourierResult<BTreeMap<String, QueueStats>> {
        drain::snapshot_queues(&self.connection, &self.stages).await
    }

    /// Poll [`debug_queues`](Self::debug_queues) until every stage queue is
    /// empty or `max_wait` has passed.
    pub async fn wait_until_drained(&self, max_wait: Duration) -> CourierResult<DrainReport> {
        drain::wait_for_drain(
            &self.connection,
            &self.stages,
            self.config.drain_poll_interval(),
            max_wait,
        )
        .await
    }

    /// Release the coordinator's own connection. Workers keep running until
    /// the supervisor is shut down.
    pub async fn close(&self) -> CourierResult<()> {
        self.publisher.close().await.ok();
        self.connection.close().await
    }
}

/// Removes a run from the routing table however `run_with` exits.
struct RunRegistration {
    runs: RunTable,
    correlation_id: String,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.correlation_id);
    }
}

/// A pipeline stage: invokes the agent, then reports completion to the run.
struct StageWorker {
    inner: InvokerWorker,
    stage_index: usize,
    runs: RunTable,
}

#[async_trait]
impl Worker for StageWorker {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        self.inner.handle(envelope).await
    }

    async fn completed(&self, output: &Envelope) {
        let Some(correlation_id) = output.correlation_id() else {
            return;
        };
        let sender = self.runs.lock().get(correlation_id).cloned();
        match sender {
            Some(sender) => {
                let event = StageEvent {
                    stage_index: self.stage_index,
                    output: output.clone(),
                };
                if sender.send(event).is_err() {
                    debug!(correlation_id, stage = self.inner.name(), "Run already finished");
                }
            }
            None => debug!(
                correlation_id,
                stage = self.inner.name(),
                "No active run for stage result"
            ),
        }
    }
}
