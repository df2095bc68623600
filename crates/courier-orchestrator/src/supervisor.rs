//! One independently restarted consumer per registered worker.

use crate::config::SupervisorConfig;
use crate::monitor::WorkerMonitor;
use crate::types::{ConsumerState, ShutdownReport, WorkerStatus};
use crate::worker::{Worker, WorkerRegistration};
use async_trait::async_trait;
use chrono::Utc;
use courier_broker::{
    BrokerConnection, ConnectionConfig, Consumer, ConsumerOptions, ConsumerPhase, MessageHandler,
    Publisher, Transport,
};
use courier_core::{CourierError, CourierResult, Envelope, HandlerError, QueueName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the consumer of every registered worker.
///
/// Each worker runs on its own task with its own broker connection. A
/// session that fails is restarted after a backoff; after
/// `max_attempts` consecutive failures the worker is marked
/// [`WorkerStatus::Failed`] and left alone.
pub struct WorkerSupervisor {
    connection: ConnectionConfig,
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    monitor: Arc<WorkerMonitor>,
    closed: AtomicBool,
}

impl WorkerSupervisor {
    /// A supervisor with no workers. Each worker connects through `transport`.
    pub fn new(
        connection: ConnectionConfig,
        transport: Arc<dyn Transport>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            connection,
            transport,
            config,
            workers: Mutex::new(HashMap::new()),
            monitor: Arc::new(WorkerMonitor::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The restart policy.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Shared view of every worker's state.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// Start a worker. A worker already registered under the same name is
    /// stopped first and replaced.
    pub async fn register(&self, registration: WorkerRegistration) -> CourierResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::Shutdown(format!(
                "cannot register '{}' after shutdown",
                registration.name
            )));
        }
        self.config.validate()?;
        let queue = registration.queue()?;

        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.remove(&registration.name) {
            info!(worker = %registration.name, "Replacing registered worker");
            if !self.stop(&registration.name, previous).await {
                warn!(worker = %registration.name, "Previous consumer abandoned during replacement");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConsumerState::starting(&registration.name));
        self.monitor.track(&registration.name, state_rx).await;

        let unit = WorkerUnit {
            name: registration.name.clone(),
            queue,
            worker: registration.handler,
            forward_to: registration.forward_to,
            connection: self.connection.clone(),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(unit.run(shutdown_rx));
        workers.insert(
            registration.name.clone(),
            WorkerHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        info!(worker = %registration.name, "Worker registered");
        Ok(())
    }

    /// Latest state of one worker.
    pub async fn status(&self, name: &str) -> Option<ConsumerState> {
        self.monitor.get_state(name).await
    }

    /// Latest state of every worker, sorted by name.
    pub async fn statuses(&self) -> Vec<ConsumerState> {
        self.monitor.snapshot().await
    }

    /// Wait until `name`'s state satisfies `predicate`.
    pub async fn wait_for_status<P>(
        &self,
        name: &str,
        predicate: P,
        timeout: Duration,
    ) -> CourierResult<ConsumerState>
    where
        P: FnMut(&ConsumerState) -> bool,
    {
        let mut rx = self
            .monitor
            .subscribe(name)
            .await
            .ok_or_else(|| CourierError::UnknownWorker(name.to_string()))?;
        let waited = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(CourierError::Shutdown(format!(
                "worker '{name}' exited without reaching the expected state"
            ))),
            Err(_) => Err(CourierError::Timeout(format!(
                "worker '{name}' did not reach the expected state within {timeout:?}"
            ))),
        };
        waited
    }

    /// Cancel every consumer and wait for each, up to the configured
    /// per-consumer timeout. Consumers that do not stop in time are aborted.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.closed.store(true, Ordering::SeqCst);
        let workers: Vec<(String, WorkerHandle)> = self.workers.lock().await.drain().collect();
        for (_, handle) in &workers {
            handle.shutdown.send_replace(true);
        }

        let mut report = ShutdownReport::default();
        for (name, handle) in workers {
            if self.stop(&name, handle).await {
                report.stopped.push(name);
            } else {
                report.abandoned.push(name);
            }
        }
        report.stopped.sort();
        report.abandoned.sort();
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "Supervisor shut down"
        );
        report
    }

    /// Returns `false` if the task had to be aborted.
    async fn stop(&self, name: &str, mut handle: WorkerHandle) -> bool {
        handle.shutdown.send_replace(true);
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut handle.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(worker = %name, error = %e, "Worker task panicked");
                true
            }
            Err(_) => {
                handle.task.abort();
                warn!(
                    worker = %name,
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "Consumer did not stop in time, abandoned"
                );
                false
            }
        }
    }
}

/// Everything one worker task owns.
struct WorkerUnit {
    name: String,
    queue: QueueName,
    worker: Arc<dyn Worker>,
    forward_to: Option<QueueName>,
    connection: ConnectionConfig,
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    state: watch::Sender<ConsumerState>,
}

impl WorkerUnit {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.update(|s| s.status = WorkerStatus::Starting);

            let mut reached_running = false;
            let session = self.session(shutdown.clone(), &mut reached_running).await;
            match session {
                Ok(()) => break,
                Err(e) => {
                    if reached_running {
                        attempt = 0;
                    }
                    attempt += 1;
                    let cause = e.to_string();
                    if attempt >= self.config.max_attempts {
                        self.update(|s| {
                            s.attempt_count = attempt;
                            s.last_error = Some(cause.clone());
                            s.status = WorkerStatus::Failed;
                        });
                        error!(
                            worker = %self.name,
                            queue = %self.queue,
                            attempts = attempt,
                            error = %e,
                            "Worker failed permanently"
                        );
                        return;
                    }

                    let delay = self.config.backoff_delay(attempt);
                    self.update(|s| {
                        s.attempt_count = attempt;
                        s.restarts += 1;
                        s.last_error = Some(cause.clone());
                        s.status = WorkerStatus::Backoff;
                    });
                    warn!(
                        worker = %self.name,
                        queue = %self.queue,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Consumer session failed, restarting after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            // A dropped sender means nobody can stop us later.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.update(|s| s.status = WorkerStatus::Stopped);
        info!(worker = %self.name, "Worker stopped");
    }

    /// One consume session on a fresh connection, closed on every exit path.
    ///
    /// Connection retries give way to shutdown.
    async fn session(
        &self,
        shutdown: watch::Receiver<bool>,
        reached_running: &mut bool,
    ) -> CourierResult<()> {
        let connection = Arc::new(BrokerConnection::new(
            self.connection.clone(),
            Arc::clone(&self.transport),
        ));
        let mut stop = shutdown.clone();
        tokio::select! {
            connected = connection.connect() => connected?,
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                connection.close().await.ok();
                debug!(worker = %self.name, "Shutdown while connecting");
                return Ok(());
            }
        }
        connection
            .scoped(|connection| async move {
                let handler = ForwardingHandler {
                    name: self.name.clone(),
                    worker: Arc::clone(&self.worker),
                    forward_to: self.forward_to.clone(),
                    publisher: Publisher::new(Arc::clone(&connection)),
                };
                let consumer = Consumer::with_options(
                    connection,
                    self.queue.clone(),
                    ConsumerOptions {
                        requeue_delay: self.config.requeue_delay(),
                        ..ConsumerOptions::default()
                    },
                );
                let mut phase = consumer.phase();
                let consume = consumer.consume(&handler, shutdown);
                tokio::pin!(consume);

                let mut watching = true;
                loop {
                    tokio::select! {
                        result = &mut consume => return result,
                        seen = phase.wait_for(|p| *p == ConsumerPhase::Consuming), if watching => {
                            watching = false;
                            if seen.is_ok() {
                                *reached_running = true;
                                self.update(|s| {
                                    s.attempt_count = 0;
                                    s.last_error = None;
                                    s.status = WorkerStatus::Running;
                                });
                                debug!(worker = %self.name, queue = %self.queue, "Worker running");
                            }
                        }
                    }
                }
            })
            .await
    }

    fn update(&self, change: impl FnOnce(&mut ConsumerState)) {
        self.state.send_modify(|state| {
            change(state);
            state.updated_at = Utc::now();
        });
    }
}

/// Decodes envelopes, runs the worker and forwards its result.
struct ForwardingHandler {
    name: String,
    worker: Arc<dyn Worker>,
    forward_to: Option<QueueName>,
    publisher: Publisher,
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        let envelope = Envelope::from_bytes(&body).map_err(|e| {
            HandlerError::permanent(format!("undecodable envelope: {e}")).for_worker(self.name.clone())
        })?;
        let correlation_id = envelope.correlation_id().map(str::to_string);
        debug!(
            worker = %self.name,
            correlation_id = correlation_id.as_deref().unwrap_or("-"),
            message_id = %envelope.message_id(),
            "Handling message"
        );

        let output = self.worker.handle(envelope).await.map_err(|e| match e.worker() {
            Some(_) => e,
            None => e.for_worker(self.name.clone()),
        })?;

        if let Some(next) = &self.forward_to {
            self.publisher.publish(next, &output).await.map_err(|e| {
                HandlerError::new(format!("forwarding to '{next}' failed: {e}"))
                    .for_worker(self.name.clone())
            })?;
            debug!(
                worker = %self.name,
                next = %next,
                correlation_id = correlation_id.as_deref().unwrap_or("-"),
                "Result forwarded"
            );
        }
        self.worker.completed(&output).await;
        Ok(())
    }
}
