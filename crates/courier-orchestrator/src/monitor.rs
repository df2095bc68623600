use crate::types::{ConsumerState, WorkerStatus};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{watch, RwLock};

/// Read side of every supervised worker's state.
///
/// Each worker task owns the sender of its state channel; the monitor only
/// keeps receivers, so reading never contends with the worker.
#[derive(Default)]
pub struct WorkerMonitor {
    states: RwLock<HashMap<String, watch::Receiver<ConsumerState>>>,
}

impl WorkerMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name`, replacing any previous receiver.
    pub async fn track(&self, name: &str, state: watch::Receiver<ConsumerState>) {
        self.states.write().await.insert(name.to_string(), state);
    }

    /// A receiver following `name`.
    pub async fn subscribe(&self, name: &str) -> Option<watch::Receiver<ConsumerState>> {
        self.states.read().await.get(name).cloned()
    }

    /// Latest state of one worker.
    pub async fn get_state(&self, name: &str) -> Option<ConsumerState> {
        let states = self.states.read().await;
        states.get(name).map(|rx| rx.borrow().clone())
    }

    /// Latest state of every worker, sorted by name.
    pub async fn snapshot(&self) -> Vec<ConsumerState> {
        let states = self.states.read().await;
        let mut all: Vec<ConsumerState> = states.values().map(|rx| rx.borrow().clone()).collect();
        all.sort_by(|a, b| a.worker.cmp(&b.worker));
        all
    }

    /// How many workers are in each status.
    pub async fn count_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for state in self.snapshot().await {
            *counts.entry(state.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether any worker has given up.
    pub async fn any_failed(&self) -> bool {
        self.snapshot()
            .await
            .iter()
            .any(|s| s.status == WorkerStatus::Failed)
    }

    /// Current states as JSON for operator output.
    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "workers": self.snapshot().await,
            "by_status": self.count_by_status().await,
        })
    }
}
