//! Boundary to the external agents doing the actual work.

use crate::worker::Worker;
use async_trait::async_trait;
use courier_core::{Envelope, HandlerError, META_CORRELATION_ID, META_STAGE_INDEX};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What an agent returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Reply text, forwarded as the next payload.
    pub content: String,
    /// Extra metadata merged into the outgoing envelope.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentReply {
    /// A reply with no metadata.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Calls the agent registered under a worker name.
///
/// Any error is a processing failure: the message is nacked and retried.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run `worker_name`'s agent on `content`.
    async fn invoke(
        &self,
        worker_name: &str,
        content: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<AgentReply, HandlerError>;
}

/// A [`Worker`] that hands each envelope to an [`AgentInvoker`].
///
/// The agent sees the envelope metadata plus `correlation_id`. The reply
/// keeps the input's correlation id, is sent as `name`, and carries
/// `stage_index` when the worker sits at a known position.
pub struct InvokerWorker {
    name: String,
    stage_index: Option<usize>,
    invoker: Arc<dyn AgentInvoker>,
}

impl InvokerWorker {
    /// A worker named `name` calling `invoker`.
    pub fn new(name: impl Into<String>, invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            name: name.into(),
            stage_index: None,
            invoker,
        }
    }

    /// Tag replies with the 1-based pipeline position of this worker.
    pub fn at_stage(mut self, stage_index: usize) -> Self {
        self.stage_index = Some(stage_index);
        self
    }

    /// The worker name replies are sent as.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Worker for InvokerWorker {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        let content = envelope.payload_str();
        debug!(
            worker = %self.name,
            correlation_id = envelope.correlation_id().unwrap_or("-"),
            bytes = envelope.payload().len(),
            "Invoking agent"
        );
        let mut metadata = envelope.metadata().clone();
        if let Some(correlation_id) = envelope.correlation_id() {
            metadata.insert(META_CORRELATION_ID.to_string(), correlation_id.to_string());
        }
        let reply = self
            .invoker
            .invoke(&self.name, &content, &metadata)
            .await
            .map_err(|e| match e.worker() {
                Some(_) => e,
                None => e.for_worker(self.name.clone()),
            })?;

        let mut reply_metadata = reply.metadata;
        reply_metadata.remove(META_CORRELATION_ID);
        let mut output =
            Envelope::text(reply.content, self.name.clone()).with_metadata_map(reply_metadata);
        if let Some(index) = self.stage_index {
            output = output.with_metadata(META_STAGE_INDEX, index.to_string());
        }
        if let Some(correlation_id) = envelope.correlation_id() {
            output = output.with_correlation_id(correlation_id);
        }
        Ok(output)
    }
}
