//! Supervisor restart, failure and shutdown behaviour against the in-process broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use courier_broker::{
    BrokerConnection, ConnectionConfig, MemoryBroker, MessageProperties, OutboundMessage,
    Publisher, Transport,
};
use courier_core::{CourierError, Envelope, HandlerError, QueueName};
use courier_orchestrator::*;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test workers
// ---------------------------------------------------------------------------

struct Upper;

#[async_trait]
impl Worker for Upper {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        let mut out = Envelope::text(envelope.payload_str().to_uppercase(), "upper");
        if let Some(id) = envelope.correlation_id() {
            out = out.with_correlation_id(id);
        }
        Ok(out)
    }
}

/// Never finishes a message.
struct Stuck;

#[async_trait]
impl Worker for Stuck {
    async fn handle(&self, _envelope: Envelope) -> Result<Envelope, HandlerError> {
        std::future::pending::<()>().await;
        Err(HandlerError::new("unreachable"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn single_attempt() -> ConnectionConfig {
    ConnectionConfig {
        connection_attempts: 1,
        retry_delay_secs: 0,
        ..ConnectionConfig::default()
    }
}

fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        shutdown_timeout_ms: 200,
        requeue_delay_ms: 10,
        ..SupervisorConfig::default()
    }
}

fn supervisor(broker: &MemoryBroker) -> WorkerSupervisor {
    WorkerSupervisor::new(single_attempt(), Arc::new(broker.clone()), fast_supervisor())
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn running(state: &ConsumerState) -> bool {
    state.status == WorkerStatus::Running
}

const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_retries_twice_then_runs() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(2);
    let sup = supervisor(&broker);
    sup.register(WorkerRegistration::new("gatherer", Arc::new(Upper)))
        .await
        .unwrap();

    let state = sup.wait_for_status("gatherer", running, WAIT).await.unwrap();
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(state.restarts, 2);
    assert_eq!(state.attempt_count, 0);
    assert!(state.last_error.is_none());

    let report = sup.shutdown().await;
    assert_eq!(report.stopped, vec!["gatherer".to_string()]);
    assert!(report.abandoned.is_empty());
    assert_eq!(
        sup.status("gatherer").await.unwrap().status,
        WorkerStatus::Stopped
    );
}

#[tokio::test]
async fn test_exhausted_attempts_mark_worker_failed() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(100);
    let sup = supervisor(&broker);
    sup.register(WorkerRegistration::new("writer", Arc::new(Upper)))
        .await
        .unwrap();

    let state = sup
        .wait_for_status("writer", |s| s.status == WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    assert_eq!(state.attempt_count, 3);
    assert!(state.last_error.as_deref().unwrap().contains("refused"));
    assert_eq!(broker.connect_attempts(), 3);

    // No further attempts once failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connect_attempts(), 3);
    assert!(sup.monitor().any_failed().await);
}

#[tokio::test]
async fn test_results_are_forwarded_and_poison_is_dead_lettered() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker);
    let out = QueueName::new("out").unwrap();
    sup.register(WorkerRegistration::new("upper", Arc::new(Upper)).forward_to(out))
        .await
        .unwrap();
    sup.wait_for_status("upper", running, WAIT).await.unwrap();

    let conn = BrokerConnection::open(single_attempt(), Arc::new(broker.clone()))
        .await
        .unwrap();
    Publisher::new(conn)
        .publish(
            &QueueName::new("upper").unwrap(),
            &Envelope::text("hello", "test").with_correlation_id("c-1"),
        )
        .await
        .unwrap();
    eventually(|| broker.peek("out").len() == 1).await;
    let forwarded = Envelope::from_bytes(&broker.peek("out")[0]).unwrap();
    assert_eq!(forwarded.payload_str(), "HELLO");
    assert_eq!(forwarded.correlation_id(), Some("c-1"));

    // A body that is not an envelope can never succeed.
    let link = broker.connect(&single_attempt()).await.unwrap();
    link.open_channel()
        .await
        .unwrap()
        .basic_publish(
            "upper",
            OutboundMessage {
                body: b"not an envelope".to_vec(),
                properties: MessageProperties::default(),
            },
        )
        .await
        .unwrap();
    eventually(|| broker.dead_letter_count("upper") == Some(1)).await;
    assert_eq!(broker.message_count("upper"), Some(0));
    assert_eq!(
        sup.status("upper").await.unwrap().status,
        WorkerStatus::Running
    );
    sup.shutdown().await;
}

#[tokio::test]
async fn test_lost_link_is_recovered() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker);
    sup.register(WorkerRegistration::new("publisher", Arc::new(Upper)))
        .await
        .unwrap();
    sup.wait_for_status("publisher", running, WAIT).await.unwrap();

    broker.drop_connections();
    let state = sup
        .wait_for_status("publisher", |s| s.restarts == 1 && running(s), WAIT)
        .await
        .unwrap();
    assert_eq!(state.attempt_count, 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn test_register_replaces_previous_worker() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker);
    sup.register(WorkerRegistration::new("gatherer", Arc::new(Upper)))
        .await
        .unwrap();
    sup.wait_for_status("gatherer", running, WAIT).await.unwrap();
    sup.register(WorkerRegistration::new("gatherer", Arc::new(Upper)))
        .await
        .unwrap();
    sup.wait_for_status("gatherer", running, WAIT).await.unwrap();

    eventually(|| broker.consumer_count("gatherer") == Some(1)).await;
    assert_eq!(sup.statuses().await.len(), 1);
    let report = sup.shutdown().await;
    assert_eq!(report.stopped.len(), 1);
}

#[tokio::test]
async fn test_shutdown_abandons_stuck_consumer() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker);
    sup.register(WorkerRegistration::new("stuck", Arc::new(Stuck)))
        .await
        .unwrap();
    sup.wait_for_status("stuck", running, WAIT).await.unwrap();

    let conn = BrokerConnection::open(single_attempt(), Arc::new(broker.clone()))
        .await
        .unwrap();
    Publisher::new(conn)
        .publish(&QueueName::new("stuck").unwrap(), &Envelope::text("x", "t"))
        .await
        .unwrap();
    eventually(|| broker.unacked_count("stuck") == Some(1)).await;

    let report = sup.shutdown().await;
    assert_eq!(report.abandoned, vec!["stuck".to_string()]);
    assert!(report.stopped.is_empty());
    // The aborted consumer's channel is gone, so the message is back.
    eventually(|| broker.message_count("stuck") == Some(1)).await;

    let err = sup
        .register(WorkerRegistration::new("late", Arc::new(Upper)))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Shutdown(_)));
}

#[tokio::test]
async fn test_shutdown_interrupts_connection_retries() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(100);
    let slow_retries = ConnectionConfig {
        connection_attempts: 3,
        retry_delay_secs: 5,
        ..ConnectionConfig::default()
    };
    let sup = WorkerSupervisor::new(slow_retries, Arc::new(broker.clone()), fast_supervisor());
    sup.register(WorkerRegistration::new("gatherer", Arc::new(Upper)))
        .await
        .unwrap();
    eventually(|| broker.connect_attempts() == 1).await;

    let report = tokio::time::timeout(Duration::from_secs(1), sup.shutdown())
        .await
        .unwrap();
    assert_eq!(report.stopped, vec!["gatherer".to_string()]);
    assert!(report.abandoned.is_empty());
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(
        sup.status("gatherer").await.unwrap().status,
        WorkerStatus::Stopped
    );
}

#[tokio::test]
async fn test_unknown_worker_status() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker);
    assert!(sup.status("ghost").await.is_none());
    let err = sup
        .wait_for_status("ghost", running, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::UnknownWorker(_)));
}
