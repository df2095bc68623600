//! Driver seam between the reliability layer and a concrete broker client.
//!
//! The traits mirror the broker protocol's own objects: a [`Transport`] makes
//! one physical connection attempt and yields a [`Link`]; a link opens
//! [`Channel`]s; a channel declares, publishes and consumes. Retry, caching
//! and acknowledgement policy all live above this seam.

use crate::config::ConnectionConfig;
use async_trait::async_trait;
use courier_core::CourierResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Broker-side message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation id carried out-of-band.
    pub correlation_id: Option<String>,
    /// String headers (envelope metadata).
    pub headers: BTreeMap<String, String>,
    /// Whether the broker must write the message to disk.
    pub persistent: bool,
    /// MIME type of the body.
    pub content_type: Option<String>,
}

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized body.
    pub body: Vec<u8>,
    /// Properties sent alongside the body.
    pub properties: MessageProperties,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages ready for delivery (unacknowledged deliveries are not counted).
    pub message_count: u32,
    /// Active consumers.
    pub consumer_count: u32,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message permanently.
    async fn ack(&self, delivery_tag: u64) -> CourierResult<()>;
    /// Reject the message, requeueing it or dead-lettering it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CourierResult<()>;
}

/// A message handed to a consumer, not yet acknowledged.
///
/// `ack` and `nack` consume the delivery, so it can be settled only once.
pub struct Delivery {
    delivery_tag: u64,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Assemble a delivery; used by drivers.
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            properties,
            redelivered,
            acker,
        }
    }

    /// Channel-scoped delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Moves the body out, leaving the delivery settleable.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Broker-side properties.
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge: the broker forgets the message.
    pub async fn ack(self) -> CourierResult<()> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Negatively acknowledge.
    pub async fn nack(self, requeue: bool) -> CourierResult<()> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Push-style sequence of deliveries from one `basic_consume`.
#[async_trait]
pub trait DeliveryStream: Send {
    /// The next delivery. `None` once the channel or link is gone.
    ///
    /// Must be cancel-safe: dropping the future never loses a message.
    async fn next(&mut self) -> Option<CourierResult<Delivery>>;
}

/// A channel multiplexed over a link. Not shared between concurrent units.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue, creating it if absent.
    async fn queue_declare(&self, queue: &str, durable: bool) -> CourierResult<QueueStats>;

    /// Read a queue's counters without creating it.
    async fn queue_inspect(&self, queue: &str) -> CourierResult<QueueStats>;

    /// Limit unacknowledged deliveries held by this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> CourierResult<()>;

    /// Publish to a queue through the default exchange and wait for the broker's confirm.
    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> CourierResult<()>;

    /// Start a consumer on a queue.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> CourierResult<Box<dyn DeliveryStream>>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> CourierResult<()>;
}

/// One open connection to the broker.
#[async_trait]
pub trait Link: Send + Sync {
    /// Whether the link is still usable.
    fn is_open(&self) -> bool;

    /// Open a fresh channel.
    async fn open_channel(&self) -> CourierResult<Box<dyn Channel>>;

    /// Close the link and every channel on it.
    async fn close(&self) -> CourierResult<()>;
}

/// A broker client able to make a single connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &str;

    /// One connection attempt; retrying is the caller's business.
    async fn connect(&self, config: &ConnectionConfig) -> CourierResult<Arc<dyn Link>>;
}
