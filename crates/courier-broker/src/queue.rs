use crate::connection::BrokerConnection;
use crate::transport::{Channel, QueueStats};
use courier_core::{CourierError, CourierResult, QueueName};
use tracing::debug;

/// Queue declaration against a [`BrokerConnection`].
///
/// Declarations are cached per connection: re-declaring a queue with the same
/// durability is a no-op, a different durability is a [`CourierError::QueueConflict`].
pub struct Queue;

impl Queue {
    /// Declare `name` on a short-lived channel.
    pub async fn declare(
        conn: &BrokerConnection,
        name: &QueueName,
        durable: bool,
    ) -> CourierResult<()> {
        Self::ensure_open(conn).await?;
        if Self::already_declared(conn, name, durable)? {
            return Ok(());
        }
        let channel = conn.open_channel().await?;
        let result = Self::declare_with(conn, channel.as_ref(), name, durable).await;
        channel.close().await.ok();
        result
    }

    /// Declare `name` on a channel the caller already holds.
    pub async fn declare_with(
        conn: &BrokerConnection,
        channel: &dyn Channel,
        name: &QueueName,
        durable: bool,
    ) -> CourierResult<()> {
        Self::ensure_open(conn).await?;
        if Self::already_declared(conn, name, durable)? {
            return Ok(());
        }
        let stats = channel.queue_declare(name.as_str(), durable).await?;
        conn.record_declared(name.as_str(), durable);
        debug!(
            queue = %name,
            durable,
            messages = stats.message_count,
            "Queue declared"
        );
        Ok(())
    }

    /// Current counters for `name`. Fails if the queue does not exist.
    pub async fn inspect(conn: &BrokerConnection, name: &QueueName) -> CourierResult<QueueStats> {
        let channel = conn.open_channel().await?;
        let result = channel.queue_inspect(name.as_str()).await;
        channel.close().await.ok();
        result
    }

    async fn ensure_open(conn: &BrokerConnection) -> CourierResult<()> {
        if conn.is_closed().await {
            return Err(CourierError::NotConnected("connection is closed".into()));
        }
        Ok(())
    }

    fn already_declared(
        conn: &BrokerConnection,
        name: &QueueName,
        durable: bool,
    ) -> CourierResult<bool> {
        match conn.declared_durability(name.as_str()) {
            Some(existing) if existing == durable => Ok(true),
            Some(existing) => Err(CourierError::QueueConflict {
                queue: name.to_string(),
                existing,
                requested: durable,
            }),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::memory::MemoryBroker;
    use std::sync::Arc;

    async fn connected(broker: &MemoryBroker) -> Arc<BrokerConnection> {
        BrokerConnection::open(ConnectionConfig::default(), Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_declare_twice_is_noop() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let name = QueueName::new("gatherer").unwrap();
        Queue::declare(&conn, &name, true).await.unwrap();
        Queue::declare(&conn, &name, true).await.unwrap();
        assert_eq!(broker.is_durable("gatherer"), Some(true));
        assert_eq!(broker.queue_names(), vec!["gatherer".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_durability_is_rejected() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let name = QueueName::new("writer").unwrap();
        Queue::declare(&conn, &name, true).await.unwrap();
        let err = Queue::declare(&conn, &name, false).await.unwrap_err();
        assert!(matches!(
            err,
            CourierError::QueueConflict {
                existing: true,
                requested: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_conflict_detected_by_broker_across_connections() {
        let broker = MemoryBroker::new();
        let first = connected(&broker).await;
        let second = connected(&broker).await;
        let name = QueueName::new("publisher").unwrap();
        Queue::declare(&first, &name, false).await.unwrap();
        let err = Queue::declare(&second, &name, true).await.unwrap_err();
        assert!(matches!(err, CourierError::QueueConflict { .. }));
    }

    #[tokio::test]
    async fn test_declare_after_close_is_not_connected() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let name = QueueName::new("gatherer").unwrap();
        Queue::declare(&conn, &name, true).await.unwrap();
        conn.close().await.unwrap();
        let err = Queue::declare(&conn, &name, true).await.unwrap_err();
        assert!(matches!(err, CourierError::NotConnected(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_inspect_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker).await;
        let name = QueueName::new("nowhere").unwrap();
        assert!(Queue::inspect(&conn, &name).await.is_err());
    }
}
