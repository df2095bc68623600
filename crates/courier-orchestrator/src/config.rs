use courier_core::{CourierError, CourierResult, QueueName};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the pause between supervisor restarts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `attempt * base_delay`.
    #[default]
    Linear,
    /// `base_delay * 2^(attempt - 1)`.
    Exponential,
}

/// Restart policy for the consumers owned by a `WorkerSupervisor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Consecutive failed sessions tolerated before a worker is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay unit fed to the backoff formula.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth of the delay between restarts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Upper bound for any single pause.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// How long `shutdown` waits for each consumer before abandoning it.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Pause after a failed message is requeued, so a failing handler does not spin.
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}
fn default_requeue_delay_ms() -> u64 {
    1_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff: BackoffStrategy::default(),
            max_delay_ms: default_max_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

impl SupervisorConfig {
    /// Reject settings that would never start a consumer.
    pub fn validate(&self) -> CourierResult<()> {
        if self.max_attempts == 0 {
            return Err(CourierError::Config(
                "supervisor.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Pause before restart number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt.max(1));
        let raw = match self.backoff {
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exp = (attempt - 1).min(32) as u32;
                self.base_delay_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Per-consumer wait during shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Pause a consumer takes after requeueing a failed message.
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

/// Shape and timing of the staged pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker names in execution order; each is also the stage's queue name.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    /// A run that does not advance for this long is abandoned.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Queue polling period while waiting for a drain.
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

fn default_stages() -> Vec<String> {
    vec![
        "gatherer".to_string(),
        "writer".to_string(),
        "publisher".to_string(),
    ]
}
fn default_stall_timeout_secs() -> u64 {
    300
}
fn default_drain_poll_interval_ms() -> u64 {
    5_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            stall_timeout_secs: default_stall_timeout_secs(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl PipelineConfig {
    /// Stage names as validated queue names. Fails on an empty or duplicated list.
    pub fn stage_queues(&self) -> CourierResult<Vec<QueueName>> {
        if self.stages.is_empty() {
            return Err(CourierError::Config(
                "pipeline needs at least one stage".into(),
            ));
        }
        let mut queues: Vec<QueueName> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let queue = QueueName::new(stage.clone())?;
            if queues.contains(&queue) {
                return Err(CourierError::Config(format!(
                    "stage '{stage}' appears more than once"
                )));
            }
            queues.push(queue);
        }
        Ok(queues)
    }

    /// See `stall_timeout_secs`.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// See `drain_poll_interval_ms`.
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}
