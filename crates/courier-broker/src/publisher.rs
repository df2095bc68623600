use crate::connection::BrokerConnection;
use crate::queue::Queue;
use crate::transport::{Channel, MessageProperties, OutboundMessage};
use courier_core::{CourierError, CourierResult, Envelope, QueueName};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Content type of every body this crate writes.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Publishes envelopes as persistent messages.
///
/// The publisher owns a private channel, opened lazily and discarded after
/// any failure so the next call starts clean. Target queues are declared
/// durable on first use.
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    channel: Mutex<Option<Box<dyn Channel>>>,
}

impl Publisher {
    /// Create a publisher on `connection`. No channel is opened yet.
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self {
            connection,
            channel: Mutex::new(None),
        }
    }

    /// The connection this publisher writes through.
    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Publish `envelope` to `queue` and wait for the broker to confirm it.
    ///
    /// Returns [`CourierError::NotConnected`] if the connection was closed,
    /// [`CourierError::Publish`] if the broker refused or the link failed.
    pub async fn publish(&self, queue: &QueueName, envelope: &Envelope) -> CourierResult<()> {
        let body = envelope.to_bytes()?;
        let message = OutboundMessage {
            body,
            properties: MessageProperties {
                correlation_id: envelope.correlation_id().map(str::to_string),
                headers: envelope.metadata().clone(),
                persistent: true,
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
            },
        };

        let mut slot = self.channel.lock().await;
        if self.connection.is_closed().await {
            if let Some(stale) = slot.take() {
                stale.close().await.ok();
            }
            return Err(CourierError::NotConnected("connection is closed".into()));
        }
        if slot.is_none() {
            let channel = self.connection.open_channel().await.map_err(|e| match e {
                CourierError::NotConnected(_) => e,
                other => publish_error(queue, &other),
            })?;
            *slot = Some(channel);
        }
        let Some(channel) = slot.as_ref() else {
            return Err(CourierError::Channel("publisher channel missing".into()));
        };

        let sent = match Queue::declare_with(&self.connection, channel.as_ref(), queue, true).await {
            Ok(()) => channel.basic_publish(queue.as_str(), message).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                debug!(
                    queue = %queue,
                    message_id = %envelope.message_id(),
                    correlation_id = envelope.correlation_id().unwrap_or("-"),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(channel) = slot.take() {
                    channel.close().await.ok();
                }
                warn!(queue = %queue, error = %e, "Publish failed");
                match e {
                    CourierError::QueueConflict { .. } => Err(e),
                    other => Err(publish_error(queue, &other)),
                }
            }
        }
    }

    /// Close the private channel, if open.
    pub async fn close(&self) -> CourierResult<()> {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }
        Ok(())
    }
}

fn publish_error(queue: &QueueName, cause: &CourierError) -> CourierError {
    CourierError::Publish {
        queue: queue.to_string(),
        reason: cause.to_string(),
    }
}
