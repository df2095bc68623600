//! RabbitMQ driver built on `lapin`.
//!
//! Each channel is put in publisher-confirm mode so `basic_publish` returns
//! only once the broker has taken responsibility for the message.

use crate::config::ConnectionConfig;
use crate::transport::{
    Acknowledger, Channel, Delivery, DeliveryStream, Link, MessageProperties, OutboundMessage,
    QueueStats, Transport,
};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const REPLY_SUCCESS: u16 = 200;
const PRECONDITION_FAILED: u16 = 406;
const PERSISTENT: u8 = 2;

/// [`Transport`] speaking AMQP 0-9-1 through `lapin`.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    connection_name: String,
}

impl AmqpTransport {
    /// A transport announcing `connection_name` to the broker.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new("courier")
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn connect(&self, config: &ConnectionConfig) -> CourierResult<Arc<dyn Link>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));
        let connection = lapin::Connection::connect(&config.amqp_uri(), properties)
            .await
            .map_err(|e| CourierError::ConnectionLost(e.to_string()))?;
        Ok(Arc::new(AmqpLink { connection }))
    }
}

struct AmqpLink {
    connection: lapin::Connection,
}

#[async_trait]
impl Link for AmqpLink {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&self) -> CourierResult<Box<dyn Channel>> {
        let channel = self.connection.create_channel().await.map_err(driver_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(driver_error)?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> CourierResult<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(driver_error)
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

impl AmqpChannel {
    async fn declare(&self, queue: &str, options: QueueDeclareOptions) -> CourierResult<QueueStats> {
        let declared = self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(driver_error)?;
        Ok(QueueStats {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn queue_declare(&self, queue: &str, durable: bool) -> CourierResult<QueueStats> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        match self.declare(queue, options).await {
            Err(CourierError::Channel(reason)) if reason.contains("PRECONDITION_FAILED") => {
                // The broker closes the channel; the existing flag is the opposite one.
                Err(CourierError::QueueConflict {
                    queue: queue.to_string(),
                    existing: !durable,
                    requested: durable,
                })
            }
            other => other,
        }
    }

    async fn queue_inspect(&self, queue: &str) -> CourierResult<QueueStats> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.declare(queue, options).await
    }

    async fn basic_qos(&self, prefetch_count: u16) -> CourierResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(driver_error)
    }

    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> CourierResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map_err(driver_error)?
            .await
            .map_err(driver_error)?;
        if confirm.is_nack() {
            return Err(CourierError::Publish {
                queue: queue.to_string(),
                reason: "broker did not confirm the message".into(),
            });
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> CourierResult<Box<dyn DeliveryStream>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(driver_error)?;
        debug!(queue, consumer_tag, "AMQP consumer registered");
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn close(&self) -> CourierResult<()> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(driver_error)?;
        }
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<CourierResult<Delivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(driver_error(e))),
        };
        let properties = from_basic_properties(&delivery.properties);
        Some(Ok(Delivery::new(
            delivery.delivery_tag,
            delivery.data,
            properties,
            delivery.redelivered,
            Box::new(AmqpAcker {
                acker: delivery.acker,
            }),
        )))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> CourierResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(driver_error)
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> CourierResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(driver_error)
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &properties.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = basic.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(text) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(text.as_bytes()).into_owned(),
                );
            }
        }
    }
    MessageProperties {
        correlation_id: basic.correlation_id().as_ref().map(|c| c.as_str().to_string()),
        headers,
        persistent: *basic.delivery_mode() == Some(PERSISTENT),
        content_type: basic.content_type().as_ref().map(|c| c.as_str().to_string()),
    }
}

fn driver_error(e: lapin::Error) -> CourierError {
    match &e {
        lapin::Error::ProtocolError(amqp) if amqp.get_id() == PRECONDITION_FAILED => {
            CourierError::Channel(format!("PRECONDITION_FAILED - {e}"))
        }
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            CourierError::ConnectionLost(e.to_string())
        }
        _ => CourierError::Channel(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_survive_conversion() {
        let mut headers = BTreeMap::new();
        headers.insert("stage_index".to_string(), "2".to_string());
        let original = MessageProperties {
            correlation_id: Some("run-7".into()),
            headers,
            persistent: true,
            content_type: Some("application/json".into()),
        };
        let converted = from_basic_properties(&to_basic_properties(&original));
        assert_eq!(converted, original);
    }

    #[test]
    fn test_transient_message_has_no_delivery_mode() {
        let basic = to_basic_properties(&MessageProperties::default());
        assert_eq!(*basic.delivery_mode(), None);
    }
}
