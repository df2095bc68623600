//! Queue-depth snapshots and drain polling.
//!
//! Counts come from the broker's own queue query and race with concurrent
//! publishes and consumes. Use them for visibility, never for correctness.

use crate::types::DrainReport;
use courier_broker::{BrokerConnection, Queue, QueueStats};
use courier_core::{CourierResult, QueueName};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Current counters for each of `queues`.
pub async fn snapshot_queues(
    connection: &BrokerConnection,
    queues: &[QueueName],
) -> CourierResult<BTreeMap<String, QueueStats>> {
    let mut snapshot = BTreeMap::new();
    for queue in queues {
        let stats = Queue::inspect(connection, queue).await?;
        snapshot.insert(queue.to_string(), stats);
    }
    Ok(snapshot)
}

/// Poll every `poll_interval` until all `queues` are empty or `max_wait` passes.
pub async fn wait_for_drain(
    connection: &BrokerConnection,
    queues: &[QueueName],
    poll_interval: Duration,
    max_wait: Duration,
) -> CourierResult<DrainReport> {
    let started = Instant::now();
    let mut polls = 0;
    loop {
        let snapshot = snapshot_queues(connection, queues).await?;
        polls += 1;
        let report = DrainReport {
            drained: false,
            polls,
            snapshot,
        };
        let pending = report.pending();
        debug!(pending, polls, "Queue depth");
        if pending == 0 {
            info!(polls, "All queues drained");
            return Ok(DrainReport {
                drained: true,
                ..report
            });
        }

        let elapsed = started.elapsed();
        if elapsed >= max_wait {
            warn!(
                pending,
                waited_ms = elapsed.as_millis() as u64,
                "Queues not drained in time"
            );
            return Ok(report);
        }
        tokio::time::sleep(poll_interval.min(max_wait - elapsed)).await;
    }
}
