use async_trait::async_trait;
use courier_core::{CourierResult, Envelope, HandlerError, QueueName};
use std::fmt;
use std::sync::Arc;

/// Processing logic bound to one named queue.
///
/// The worker receives decoded envelopes and returns the envelope to forward.
/// Behaviour is looked up by worker name at the receiver; only data crosses
/// the queue.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Process one envelope.
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError>;

    /// Called once the output of `handle` has been forwarded (or, with no
    /// forward target, right after `handle` succeeded) and before the input
    /// is acknowledged.
    async fn completed(&self, _output: &Envelope) {}
}

#[async_trait]
impl<W: Worker + ?Sized> Worker for Arc<W> {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        (**self).handle(envelope).await
    }

    async fn completed(&self, output: &Envelope) {
        (**self).completed(output).await
    }
}

/// A named worker, its handler and where its results go.
#[derive(Clone)]
pub struct WorkerRegistration {
    /// Unique worker name; also the name of the queue it consumes.
    pub name: String,
    /// Processes each envelope taken from the queue.
    pub handler: Arc<dyn Worker>,
    /// Queue receiving each result envelope. Results are dropped when `None`.
    pub forward_to: Option<QueueName>,
}

impl WorkerRegistration {
    /// A registration without forwarding.
    pub fn new(name: impl Into<String>, handler: Arc<dyn Worker>) -> Self {
        Self {
            name: name.into(),
            handler,
            forward_to: None,
        }
    }

    /// Forward every result to `queue`.
    pub fn forward_to(mut self, queue: QueueName) -> Self {
        self.forward_to = Some(queue);
        self
    }

    /// The queue this worker consumes.
    pub fn queue(&self) -> CourierResult<QueueName> {
        QueueName::new(self.name.clone())
    }
}

impl fmt::Debug for WorkerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistration")
            .field("name", &self.name)
            .field("forward_to", &self.forward_to)
            .finish_non_exhaustive()
    }
}
