use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`CourierError`].
pub type CourierResult<T> = Result<T, CourierError>;

/// Top-level error type for the courier workspace.
///
/// Connection and declaration errors are fatal for the component that owns
/// the connection. Message-processing errors ([`CourierError::Handler`]) are
/// contained by the consumer, which nacks and logs them.
#[derive(Error, Debug)]
pub enum CourierError {
    /// The broker could not be reached after every configured attempt.
    #[error("Connection error after {attempts} attempt(s): {cause}")]
    Connection {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The last underlying cause reported by the driver.
        cause: String,
    },

    /// An operation was attempted on a connection that is closed.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The link to the broker went away while it was in use.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A queue was re-declared with a different durability flag.
    #[error("Queue conflict on '{queue}': declared durable={existing}, requested durable={requested}")]
    QueueConflict {
        /// The queue name.
        queue: String,
        /// Durability the queue already has.
        existing: bool,
        /// Durability that was requested.
        requested: bool,
    },

    /// A message could not be handed to the broker.
    #[error("Publish error on '{queue}': {reason}")]
    Publish {
        /// Target queue.
        queue: String,
        /// Why the broker refused or could not be reached.
        reason: String,
    },

    /// A channel-level protocol failure not covered by a more specific variant.
    #[error("Channel error: {0}")]
    Channel(String),

    /// A message handler failed.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A pipeline run stopped advancing and was abandoned.
    #[error("Pipeline run {correlation_id} stalled at stage {stage_index} for {stalled_for:?}")]
    PipelineTimeout {
        /// Correlation id of the abandoned run.
        correlation_id: String,
        /// Number of stages that had completed when the run stalled.
        stage_index: usize,
        /// How long the run went without advancing.
        stalled_for: Duration,
    },

    /// No worker is registered under the given name.
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    /// Waiting for a condition took longer than allowed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The component is shutting down and no longer accepts work.
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Invalid configuration or argument.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Whether the error came from losing (or never having) a broker link,
    /// as opposed to a protocol or programming error.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            CourierError::Connection { .. }
                | CourierError::ConnectionLost(_)
                | CourierError::NotConnected(_)
        )
    }
}

/// Failure raised while processing a single message.
///
/// Wraps whatever the external agent invocation reported. The consumer
/// recovers from it locally by nacking the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    worker: Option<String>,
    permanent: bool,
}

impl HandlerError {
    /// Create a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            worker: None,
            permanent: false,
        }
    }

    /// A failure that redelivery cannot fix (e.g. an undecodable body).
    /// Such messages are dead-lettered instead of requeued.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(message)
        }
    }

    /// Attach the name of the worker that failed.
    pub fn for_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The worker that failed, if known.
    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// Whether redelivering the message is pointless.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::permanent(format!("undecodable payload: {e}"))
    }
}
