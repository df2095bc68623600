//! Reliable messaging over a message broker.
//!
//! [`BrokerConnection`] owns the link and its retry policy, [`Queue`]
//! declares durable queues, [`Publisher`] writes persistent envelopes and
//! [`Consumer`] runs an acknowledge-after-success loop that can be cancelled.
//! Drivers plug in through the [`transport`] traits: [`MemoryBroker`] runs in
//! process and the `amqp` feature adds a RabbitMQ driver.

/// Connection settings and retry policy.
pub mod config;
/// The broker connection and scoped acquisition.
pub mod connection;
/// Acknowledge-after-success consumption.
pub mod consumer;
/// In-process broker driver.
pub mod memory;
/// Persistent envelope publishing.
pub mod publisher;
/// Queue declaration and inspection.
pub mod queue;
/// Driver traits.
pub mod transport;

/// RabbitMQ driver.
#[cfg(feature = "amqp")]
pub mod amqp;

pub use config::{ConnectionConfig, RetryPolicy};
pub use connection::{with_connection, BrokerConnection};
pub use consumer::{
    handler_fn, Consumer, ConsumerOptions, ConsumerPhase, FnHandler, MessageHandler,
    PREFETCH_COUNT,
};
pub use memory::MemoryBroker;
pub use publisher::{Publisher, CONTENT_TYPE_JSON};
pub use queue::Queue;
pub use transport::{
    Acknowledger, Channel, Delivery, DeliveryStream, Link, MessageProperties, OutboundMessage,
    QueueStats, Transport,
};

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
