//! Long-running, cancellable consumption of one queue.
//!
//! A [`Consumer`] holds at most one unacknowledged message at a time
//! (prefetch 1). A message is acknowledged only after the handler returns
//! `Ok`; a failed handler leaves the message on the queue for redelivery.

use crate::connection::BrokerConnection;
use crate::queue::Queue;
use crate::transport::{Channel, Delivery};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult, HandlerError, QueueName};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Unacknowledged deliveries a consumer may hold.
pub const PREFETCH_COUNT: u16 = 1;

/// Processes one message body.
///
/// Returning `Err` nacks the message; a [permanent](HandlerError::is_permanent)
/// error dead-letters it instead of requeueing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle the raw body of one delivery.
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        (**self).handle(body).await
    }
}

/// A [`MessageHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        (self.0)(body).await
    }
}

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    /// `consume` has not been called yet.
    Idle,
    /// Waiting for the next delivery.
    Consuming,
    /// Acknowledging a handled message.
    Acking,
    /// Rejecting a failed message.
    Nacking,
    /// The loop has exited.
    Stopped,
}

/// Tunables for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Requeue messages whose handler failed with a transient error.
    pub requeue_on_error: bool,
    /// Pause after a requeue before taking the next delivery.
    pub requeue_delay: Duration,
    /// Durability used when declaring the queue.
    pub durable: bool,
    /// Broker-side consumer tag; generated when `None`.
    pub consumer_tag: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            requeue_on_error: true,
            requeue_delay: Duration::from_secs(1),
            durable: true,
            consumer_tag: None,
        }
    }
}

/// Consumes one queue until cancelled or the link is lost.
pub struct Consumer {
    connection: Arc<BrokerConnection>,
    queue: QueueName,
    options: ConsumerOptions,
    phase: watch::Sender<ConsumerPhase>,
}

impl Consumer {
    /// A consumer for `queue` with default options.
    pub fn new(connection: Arc<BrokerConnection>, queue: QueueName) -> Self {
        Self::with_options(connection, queue, ConsumerOptions::default())
    }

    /// A consumer for `queue` with explicit options.
    pub fn with_options(
        connection: Arc<BrokerConnection>,
        queue: QueueName,
        options: ConsumerOptions,
    ) -> Self {
        let (phase, _) = watch::channel(ConsumerPhase::Idle);
        Self {
            connection,
            queue,
            options,
            phase,
        }
    }

    /// The queue being consumed.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Subscribe to lifecycle changes.
    pub fn phase(&self) -> watch::Receiver<ConsumerPhase> {
        self.phase.subscribe()
    }

    /// Consume until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// A message already being handled is settled before returning. Returns
    /// `Ok(())` on cancellation or when the connection was closed by its
    /// owner, [`CourierError::ConnectionLost`] when the link dropped, and the
    /// setup error if the queue could not be declared or subscribed.
    pub async fn consume<H>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> CourierResult<()>
    where
        H: MessageHandler + ?Sized,
    {
        let channel = self.connection.open_channel().await?;
        let result = self.run(channel.as_ref(), handler, &mut shutdown).await;
        channel.close().await.ok();
        self.phase.send_replace(ConsumerPhase::Stopped);
        match &result {
            Ok(()) => info!(queue = %self.queue, "Consumer stopped"),
            Err(e) => warn!(queue = %self.queue, error = %e, "Consumer exited with error"),
        }
        result
    }

    async fn run<H>(
        &self,
        channel: &dyn Channel,
        handler: &H,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CourierResult<()>
    where
        H: MessageHandler + ?Sized,
    {
        Queue::declare_with(&self.connection, channel, &self.queue, self.options.durable).await?;
        channel.basic_qos(PREFETCH_COUNT).await?;
        let tag = self.options.consumer_tag.clone().unwrap_or_else(|| {
            format!("courier-{}-{}", self.queue, uuid::Uuid::new_v4().simple())
        });
        let mut stream = channel.basic_consume(self.queue.as_str(), &tag).await?;
        self.phase.send_replace(ConsumerPhase::Consuming);
        info!(queue = %self.queue, consumer_tag = %tag, "Consumer started");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    let requeued = self.process(handler, delivery).await?;
                    if requeued && !self.options.requeue_delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.options.requeue_delay) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if self.connection.is_closed().await {
                        return Ok(());
                    }
                    return Err(CourierError::ConnectionLost(format!(
                        "delivery stream for '{}' ended",
                        self.queue
                    )));
                }
            }
        }
    }

    /// Run the handler on one delivery and settle it. Returns whether the
    /// message went back onto the queue.
    async fn process<H>(&self, handler: &H, mut delivery: Delivery) -> CourierResult<bool>
    where
        H: MessageHandler + ?Sized,
    {
        let tag = delivery.delivery_tag();
        let redelivered = delivery.redelivered();
        let body = delivery.take_body();

        let outcome = match AssertUnwindSafe(handler.handle(body)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let requeued = match outcome {
            Ok(()) => {
                self.phase.send_replace(ConsumerPhase::Acking);
                delivery.ack().await?;
                debug!(queue = %self.queue, delivery_tag = tag, redelivered, "Message acknowledged");
                false
            }
            Err(e) => {
                let requeue = self.options.requeue_on_error && !e.is_permanent();
                self.phase.send_replace(ConsumerPhase::Nacking);
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    redelivered,
                    requeue,
                    worker = e.worker().unwrap_or("-"),
                    error = %e,
                    "Handler failed, rejecting message"
                );
                delivery.nack(requeue).await?;
                requeue
            }
        };
        self.phase.send_replace(ConsumerPhase::Consuming);
        Ok(requeued)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
