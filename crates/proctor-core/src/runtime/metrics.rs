//! Per-agent counters and the lifecycle event ring.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many lifecycle events are retained per agent.
const LIFECYCLE_RING_CAP: usize = 50;

/// One entry in an agent's lifecycle ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    pub what: String,
}

#[derive(Default)]
pub struct AgentMetrics {
    processed: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
    processing_ms_total: AtomicU64,
    last_error: Mutex<Option<String>>,
    lifecycle: Mutex<VecDeque<LifecycleEvent>>,
}

/// Point-in-time view of one agent's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricsSnapshot {
    pub processed: u64,
    pub acked: u64,
    pub failed: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub avg_processing_ms: f64,
    pub lifecycle: Vec<LifecycleEvent>,
}

impl AgentMetrics {
    /// Record a successfully handled and acknowledged message.
    pub fn record_success(&self, elapsed_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.processing_ms_total.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    /// Record a failed message.
    pub fn record_failure(&self, error: &str) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    /// Append a lifecycle event, trimming the ring to its capacity.
    pub fn record_lifecycle(&self, what: impl Into<String>) {
        if let Ok(mut ring) = self.lifecycle.lock() {
            ring.push_back(LifecycleEvent {
                at: Utc::now(),
                what: what.into(),
            });
            while ring.len() > LIFECYCLE_RING_CAP {
                ring.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> AgentMetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let acked = self.acked.load(Ordering::Relaxed);
        let total_ms = self.processing_ms_total.load(Ordering::Relaxed);
        AgentMetricsSnapshot {
            processed,
            acked,
            failed: self.failed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|l| l.clone()),
            avg_processing_ms: if acked == 0 {
                0.0
            } else {
                total_ms as f64 / acked as f64
            },
            lifecycle: self
                .lifecycle
                .lock()
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}
