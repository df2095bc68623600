//! End-to-end delivery guarantees against the in-process broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use courier_broker::{
    handler_fn, BrokerConnection, ConnectionConfig, Consumer, ConsumerOptions, MemoryBroker,
    Publisher, Queue,
};
use courier_core::{CourierError, Envelope, HandlerError, QueueName};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        retry_delay_secs: 0,
        ..ConnectionConfig::default()
    }
}

async fn connect(broker: &MemoryBroker) -> Arc<BrokerConnection> {
    BrokerConnection::open(fast_config(), Arc::new(broker.clone()))
        .await
        .unwrap()
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

#[tokio::test]
async fn test_payload_bytes_arrive_unchanged() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let queue = QueueName::new("gatherer").unwrap();
    let payload: Vec<u8> = (0u8..=255).collect();
    let sent = Envelope::new(payload.clone(), "coordinator")
        .with_correlation_id("run-42")
        .with_metadata("stage_index", "0");
    Publisher::new(Arc::clone(&conn))
        .publish(&queue, &sent)
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |body| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(Envelope::from_bytes(&body).map_err(|e| HandlerError::permanent(e.to_string()))?);
            Ok(())
        }
    });

    let consumer = Consumer::new(Arc::clone(&conn), queue);
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = consumer.consume(&handler, stop_rx);
    let stop = async {
        eventually(|| !received.lock().is_empty()).await;
        stop_tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    let got = received.lock();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload(), payload.as_slice());
    assert_eq!(got[0].correlation_id(), Some("run-42"));
    assert_eq!(got[0], sent);
    assert_eq!(broker.message_count("gatherer"), Some(0));
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_link_loss() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let queue = QueueName::new("writer").unwrap();
    Publisher::new(Arc::clone(&conn))
        .publish(&queue, &Envelope::text("draft", "gatherer"))
        .await
        .unwrap();

    // The first consumer stalls inside the handler; the link then drops.
    let started = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&started);
    let stuck = handler_fn(move |_body| {
        let flag = Arc::clone(&flag);
        async move {
            flag.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    });
    let first = Arc::new(Consumer::new(Arc::clone(&conn), queue.clone()));
    let (_stop_tx, stop_rx) = watch::channel(false);
    let stalled = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.consume(&stuck, stop_rx).await })
    };
    eventually(|| started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.unacked_count("writer"), Some(1));

    broker.drop_connections();
    stalled.abort();
    assert_eq!(broker.message_count("writer"), Some(1));

    // A reconnected consumer sees the same message again.
    conn.connect().await.unwrap();
    let redelivered = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&redelivered);
    let handler = handler_fn(move |_body| {
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let second = Consumer::new(Arc::clone(&conn), queue);
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = second.consume(&handler, stop_rx);
    let stop = async {
        eventually(|| redelivered.load(Ordering::SeqCst) == 1).await;
        stop_tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();
    assert_eq!(broker.message_count("writer"), Some(0));
    assert_eq!(broker.unacked_count("writer"), Some(0));
}

#[tokio::test]
async fn test_durable_queue_survives_restart() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let durable = QueueName::new("publisher").unwrap();
    let transient = QueueName::new("scratch").unwrap();
    Publisher::new(Arc::clone(&conn))
        .publish(&durable, &Envelope::text("final", "writer"))
        .await
        .unwrap();
    Queue::declare(&conn, &transient, false).await.unwrap();

    broker.restart();
    assert!(matches!(
        conn.open_channel().await,
        Err(CourierError::ConnectionLost(_))
    ));

    conn.connect().await.unwrap();
    assert_eq!(broker.message_count("publisher"), Some(1));
    assert_eq!(broker.message_count("scratch"), None);
    // The declaration cache was reset by the reconnect.
    Queue::declare(&conn, &transient, false).await.unwrap();
    assert_eq!(broker.is_durable("scratch"), Some(false));
}

#[tokio::test]
async fn test_failure_then_success_settles_once() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker).await;
    let queue = QueueName::new("gatherer").unwrap();
    Publisher::new(Arc::clone(&conn))
        .publish(&queue, &Envelope::text("topic", "coordinator"))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn(move |_body| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HandlerError::new("transient"))
            } else {
                Ok(())
            }
        }
    });
    let consumer = Consumer::with_options(
        Arc::clone(&conn),
        queue,
        ConsumerOptions {
            requeue_delay: Duration::from_millis(10),
            ..ConsumerOptions::default()
        },
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = consumer.consume(&handler, stop_rx);
    let stop = async {
        eventually(|| {
            calls.load(Ordering::SeqCst) == 2 && broker.unacked_count("gatherer") == Some(0)
        })
        .await;
        stop_tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();
    assert_eq!(broker.message_count("gatherer"), Some(0));
    assert_eq!(broker.dead_letter_count("gatherer"), Some(0));
}
