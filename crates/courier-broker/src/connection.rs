use crate::config::{ConnectionConfig, RetryPolicy};
use crate::transport::{Channel, Link, Transport};
use courier_core::{CourierError, CourierResult};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A single logical connection to the broker.
///
/// `connect` is idempotent and retries according to a [`RetryPolicy`].
/// Channels opened from it are private to whoever opened them. Once
/// [`close`](Self::close) has been called every operation fails with
/// [`CourierError::NotConnected`] until `connect` is called again.
pub struct BrokerConnection {
    config: ConnectionConfig,
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    link: tokio::sync::Mutex<Option<Arc<dyn Link>>>,
    /// Durability of every queue declared through this connection.
    declared: Mutex<HashMap<String, bool>>,
}

impl BrokerConnection {
    /// Create an unconnected handle using the retry policy from `config`.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let policy = config.retry_policy();
        Self::with_policy(config, transport, policy)
    }

    /// Create an unconnected handle with an explicit retry policy.
    pub fn with_policy(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            config,
            policy,
            transport,
            link: tokio::sync::Mutex::new(None),
            declared: Mutex::new(HashMap::new()),
        }
    }

    /// Create and connect in one step.
    pub async fn open(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> CourierResult<Arc<Self>> {
        let connection = Arc::new(Self::new(config, transport));
        connection.connect().await?;
        Ok(connection)
    }

    /// The settings this connection was built from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The retry policy applied by [`connect`](Self::connect).
    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Establish the link. A no-op while an open link exists.
    ///
    /// Fails with [`CourierError::Connection`] once every attempt is spent.
    pub async fn connect(&self) -> CourierResult<()> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| l.is_open()) {
            return Ok(());
        }

        let endpoint = self.config.endpoint();
        let transport = Arc::clone(&self.transport);
        let config = &self.config;
        let established = self
            .policy
            .run(&endpoint, |attempt| {
                debug!(endpoint = %endpoint, attempt, transport = transport.name(), "Connecting to broker");
                let transport = Arc::clone(&transport);
                async move { transport.connect(config).await }
            })
            .await?;

        // A fresh link may face a restarted broker; forget what was declared.
        self.declared.lock().clear();
        *link = Some(established);
        info!(endpoint = %endpoint, transport = self.transport.name(), "Successfully connected to broker");
        Ok(())
    }

    /// Release the link. Safe to call repeatedly.
    pub async fn close(&self) -> CourierResult<()> {
        let taken = self.link.lock().await.take();
        self.declared.lock().clear();
        if let Some(link) = taken {
            if link.is_open() {
                link.close().await?;
                info!(endpoint = %self.config.endpoint(), "Broker connection closed");
            }
        }
        Ok(())
    }

    /// Whether an open link exists.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(|l| l.is_open())
    }

    /// Whether [`close`](Self::close) was called (or `connect` never was).
    pub async fn is_closed(&self) -> bool {
        self.link.lock().await.is_none()
    }

    /// Open a private channel on the current link.
    ///
    /// [`CourierError::NotConnected`] if the connection was closed;
    /// [`CourierError::ConnectionLost`] if the link dropped underneath.
    pub async fn open_channel(&self) -> CourierResult<Box<dyn Channel>> {
        let link = {
            let guard = self.link.lock().await;
            guard
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| CourierError::NotConnected("connection is closed".into()))?
        };
        if !link.is_open() {
            return Err(CourierError::ConnectionLost(format!(
                "link to {} dropped",
                self.config.endpoint()
            )));
        }
        link.open_channel().await
    }

    /// Run `body` with this connection open, closing it afterwards on every
    /// exit path: success, error, or panic (which is then resumed).
    pub async fn scoped<F, Fut, T>(self: Arc<Self>, body: F) -> CourierResult<T>
    where
        F: FnOnce(Arc<BrokerConnection>) -> Fut,
        Fut: Future<Output = CourierResult<T>>,
    {
        self.connect().await?;
        let outcome = AssertUnwindSafe(body(Arc::clone(&self)))
            .catch_unwind()
            .await;
        if let Err(e) = self.close().await {
            warn!(endpoint = %self.config.endpoint(), error = %e, "Failed to close broker connection");
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub(crate) fn declared_durability(&self, queue: &str) -> Option<bool> {
        self.declared.lock().get(queue).copied()
    }

    pub(crate) fn record_declared(&self, queue: &str, durable: bool) {
        self.declared.lock().insert(queue.to_string(), durable);
    }
}

/// Open a connection, run `body`, and close the connection on every exit path.
pub async fn with_connection<F, Fut, T>(
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    body: F,
) -> CourierResult<T>
where
    F: FnOnce(Arc<BrokerConnection>) -> Fut,
    Fut: Future<Output = CourierResult<T>>,
{
    Arc::new(BrokerConnection::new(config, transport))
        .scoped(body)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::time::Duration;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            retry_delay_secs: 0,
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(fast_config(), Arc::new(broker.clone()));
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_link_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2);
        let conn = BrokerConnection::new(fast_config(), Arc::new(broker.clone()));
        conn.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_gives_up_with_last_cause() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(10);
        let conn = BrokerConnection::with_policy(
            fast_config(),
            Arc::new(broker.clone()),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );
        let err = conn.connect().await.unwrap_err();
        match err {
            CourierError::Connection { attempts, cause } => {
                assert_eq!(attempts, 3);
                assert!(cause.contains("refused"), "cause: {cause}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(fast_config(), Arc::new(broker.clone()));
        assert!(matches!(
            conn.open_channel().await,
            Err(CourierError::NotConnected(_))
        ));

        conn.connect().await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.open_channel().await,
            Err(CourierError::NotConnected(_))
        ));
        assert_eq!(broker.open_link_count(), 0);
    }

    #[tokio::test]
    async fn test_close_forgets_declared_queues() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(fast_config(), Arc::new(broker));
        conn.connect().await.unwrap();
        conn.record_declared("gatherer", true);
        conn.close().await.unwrap();
        assert_eq!(conn.declared_durability("gatherer"), None);
    }

    #[tokio::test]
    async fn test_dropped_link_reports_connection_lost() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(fast_config(), Arc::new(broker.clone()));
        conn.connect().await.unwrap();
        broker.drop_connections();
        assert!(matches!(
            conn.open_channel().await,
            Err(CourierError::ConnectionLost(_))
        ));
        // connect() notices the dead link and re-establishes it.
        conn.connect().await.unwrap();
        assert!(conn.open_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_scoped_closes_on_error() {
        let broker = MemoryBroker::new();
        let result: CourierResult<()> =
            with_connection(fast_config(), Arc::new(broker.clone()), |conn| async move {
                assert!(conn.is_connected().await);
                Err(CourierError::Config("boom".into()))
            })
            .await;
        assert!(matches!(result, Err(CourierError::Config(_))));
        assert_eq!(broker.open_link_count(), 0);
    }

    #[tokio::test]
    async fn test_scoped_closes_on_panic() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.clone());
        let handle = tokio::spawn(async move {
            with_connection(fast_config(), transport, |_conn| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            })
            .await
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(broker.open_link_count(), 0);
    }
}
