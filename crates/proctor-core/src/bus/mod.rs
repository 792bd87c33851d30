//! The priority message bus: at-least-once delivery over three priority
//! queues, with retry/backoff, dead-lettering, idempotent sends, processing
//! leases, and an audit trail.

pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Message, Priority};
use store::{QueueStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to bus callers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus backing store unavailable: {0}")]
    Unavailable(#[from] StoreError),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bus tunables. Queue names are logical keys in the backing store.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub default_queue: String,
    pub high_queue: String,
    pub critical_queue: String,
    pub dead_letter_queue: String,
    /// Retries allowed beyond the first delivery. A message is delivered at
    /// most `max_retries + 1` times before it is dead-lettered.
    pub max_retries: u64,
    /// Fixed backoff applied before a failed message is requeued.
    pub retry_delay: Duration,
    pub attempts_ttl: Duration,
    pub lease_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub audit_key: String,
    pub audit_cap: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_queue: "queue:default".to_string(),
            high_queue: "queue:high".to_string(),
            critical_queue: "queue:critical".to_string(),
            dead_letter_queue: "queue:dlq".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            attempts_ttl: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(600),
            idempotency_ttl: Duration::from_secs(3600),
            audit_key: "audit:agent-comm".to_string(),
            audit_cap: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Kind of audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    Send,
    Consume,
    Ack,
    Retry,
    Dlq,
}

/// One entry in the bounded audit ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "type")]
    pub entry_type: AuditType,
    pub ts: DateTime<Utc>,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    fn new(entry_type: AuditType, message_id: Uuid) -> Self {
        Self {
            entry_type,
            ts: Utc::now(),
            message_id,
            queue: None,
            kind: None,
            attempts: None,
            reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusMetrics {
    enqueued: AtomicU64,
    deduplicated: AtomicU64,
    consumed: AtomicU64,
    acknowledged: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    queue_wait_ms_total: AtomicU64,
    queue_wait_samples: AtomicU64,
}

/// Point-in-time view of the bus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMetricsSnapshot {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub consumed: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub avg_queue_wait_ms: f64,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of [`PriorityBus::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// The idempotency key was already seen inside its TTL window; the
    /// message was silently dropped.
    DuplicateDropped,
}

/// Outcome of [`PriorityBus::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { attempts: u64 },
    DeadLettered { attempts: u64 },
}

/// A consumed message plus its delivery metadata.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// The queue the message was popped from.
    pub queue: String,
    /// Delivery count for this message id, this one included.
    pub attempts: u64,
}

/// Current queue depths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub default: usize,
    pub high: usize,
    pub critical: usize,
    pub dlq: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.default + self.high + self.critical + self.dlq
    }
}

/// Counts returned by [`PriorityBus::reset_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSummary {
    /// Queued items (all four queues) before the reset.
    pub before: usize,
    /// Store keys removed (queues, leases, counters, markers, audit).
    pub deleted: usize,
    /// Queued items after the reset. Always zero on success.
    pub after: usize,
}

/// A message wrapper pushed onto the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: serde_json::Value,
    pub failed_at: DateTime<Utc>,
    pub attempts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

/// Durable priority queue with at-least-once delivery semantics.
///
/// Consumers pop the critical, high, and default queues in strict order, so
/// under contention critical always wins and starvation of lower priorities
/// is accepted.
pub struct PriorityBus {
    store: Arc<dyn QueueStore>,
    config: BusConfig,
    metrics: BusMetrics,
}

fn lease_key(id: Uuid) -> String {
    format!("processing:{id}")
}

fn attempts_key(id: Uuid) -> String {
    format!("attempts:{id}")
}

fn idempotency_key(key: &str) -> String {
    format!("idem:{key}")
}

impl PriorityBus {
    pub fn new(store: Arc<dyn QueueStore>, config: BusConfig) -> Self {
        Self {
            store,
            config,
            metrics: BusMetrics::default(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn queue_for(&self, priority: Priority) -> &str {
        match priority {
            Priority::Critical => &self.config.critical_queue,
            Priority::High => &self.config.high_queue,
            Priority::Low | Priority::Normal => &self.config.default_queue,
        }
    }

    /// Enqueue a message on the queue matching its priority.
    ///
    /// If the message carries an idempotency key that was already seen
    /// within the idempotency TTL, the message is silently dropped.
    pub async fn send(&self, mut msg: Message) -> Result<SendOutcome, BusError> {
        if let Some(key) = msg.idempotency_key.clone() {
            let fresh = self
                .store
                .set_if_absent(&idempotency_key(&key), "1".to_string(), self.config.idempotency_ttl)
                .await?;
            if !fresh {
                debug!(message_id = %msg.id, idempotency_key = %key, "duplicate send dropped");
                self.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
                return Ok(SendOutcome::DuplicateDropped);
            }
        }

        msg.enqueued_at = Some(Utc::now().timestamp_millis());
        let queue = self.queue_for(msg.priority).to_string();
        let raw = serde_json::to_string(&msg).map_err(BusError::Encode)?;
        self.store.push(&queue, raw).await?;
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);

        let mut entry = AuditEntry::new(AuditType::Send, msg.id);
        entry.queue = Some(queue);
        entry.kind = Some(msg.kind().to_string());
        self.audit(entry).await?;

        Ok(SendOutcome::Enqueued)
    }

    /// Pop the next message in strict priority order.
    ///
    /// Returns `Ok(None)` when no message arrives within `timeout`. On pop,
    /// a processing lease is created, the attempt counter is incremented,
    /// and both are attached to the returned [`Delivery`]. A payload that
    /// does not decode is dead-lettered with reason `parse-error` and the
    /// pop continues.
    pub async fn consume_next(&self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let popped = self
                .store
                .pop_first(
                    &[
                        self.config.critical_queue.as_str(),
                        self.config.high_queue.as_str(),
                        self.config.default_queue.as_str(),
                    ],
                    remaining,
                )
                .await?;

            let Some((queue, raw)) = popped else {
                return Ok(None);
            };

            let msg: Message = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "undecodable message, dead-lettering");
                    self.dead_letter_raw(raw, "parse-error").await?;
                    continue;
                }
            };

            let lease = serde_json::json!({
                "claimed_at": Utc::now().timestamp_millis(),
                "queue": queue,
            });
            self.store
                .set(&lease_key(msg.id), lease.to_string(), Some(self.config.lease_ttl))
                .await?;

            let attempts = self
                .store
                .incr(&attempts_key(msg.id), self.config.attempts_ttl)
                .await?;

            if let Some(enqueued_at) = msg.enqueued_at {
                let wait = (Utc::now().timestamp_millis() - enqueued_at).max(0) as u64;
                self.metrics.queue_wait_ms_total.fetch_add(wait, Ordering::Relaxed);
                self.metrics.queue_wait_samples.fetch_add(1, Ordering::Relaxed);
            }
            self.metrics.consumed.fetch_add(1, Ordering::Relaxed);

            let mut entry = AuditEntry::new(AuditType::Consume, msg.id);
            entry.queue = Some(queue.clone());
            entry.kind = Some(msg.kind().to_string());
            entry.attempts = Some(attempts);
            self.audit(entry).await?;

            return Ok(Some(Delivery {
                message: msg,
                queue,
                attempts,
            }));
        }
    }

    /// Release a message: delete its processing lease and attempt counter.
    /// Idempotent.
    pub async fn acknowledge(&self, id: Uuid) -> Result<(), BusError> {
        self.store.delete(&lease_key(id)).await?;
        self.store.delete(&attempts_key(id)).await?;
        self.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.audit(AuditEntry::new(AuditType::Ack, id)).await?;
        Ok(())
    }

    /// Record a failed delivery: requeue the message onto its original
    /// priority queue, or dead-letter it once the retry allowance is spent.
    pub async fn fail(&self, msg: &Message) -> Result<FailOutcome, BusError> {
        self.fail_with_reason(msg, None).await
    }

    /// Like [`Self::fail`], recording `reason` on the dead letter if the
    /// message ends up in the DLQ.
    pub async fn fail_with_reason(
        &self,
        msg: &Message,
        reason: Option<&str>,
    ) -> Result<FailOutcome, BusError> {
        let attempts = match self.store.get(&attempts_key(msg.id)).await? {
            Some(raw) => raw.parse::<u64>().unwrap_or(0),
            None => 0,
        };

        if attempts > self.config.max_retries {
            let dead = DeadLetter {
                message: serde_json::to_value(msg).map_err(BusError::Encode)?,
                failed_at: Utc::now(),
                attempts,
                reason: reason.map(str::to_owned),
            };
            let raw = serde_json::to_string(&dead).map_err(BusError::Encode)?;
            self.store.push(&self.config.dead_letter_queue, raw).await?;
            self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);

            let mut entry = AuditEntry::new(AuditType::Dlq, msg.id);
            entry.attempts = Some(attempts);
            entry.reason = reason.map(str::to_owned);
            self.audit(entry).await?;

            self.acknowledge(msg.id).await?;
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        if !self.config.retry_delay.is_zero() {
            tokio::time::sleep(self.config.retry_delay).await;
        }

        let queue = self.queue_for(msg.priority).to_string();
        let raw = serde_json::to_string(msg).map_err(BusError::Encode)?;
        self.store.push(&queue, raw).await?;
        self.metrics.retried.fetch_add(1, Ordering::Relaxed);

        let mut entry = AuditEntry::new(AuditType::Retry, msg.id);
        entry.queue = Some(queue);
        entry.attempts = Some(attempts);
        self.audit(entry).await?;

        // The lease is released; the attempt counter is retained so the
        // retry allowance keeps counting across redeliveries.
        self.store.delete(&lease_key(msg.id)).await?;
        Ok(FailOutcome::Requeued { attempts })
    }

    /// Dead-letter a raw payload that never decoded into a message.
    async fn dead_letter_raw(&self, raw: String, reason: &str) -> Result<(), BusError> {
        let dead = DeadLetter {
            message: serde_json::Value::String(raw),
            failed_at: Utc::now(),
            attempts: 0,
            reason: Some(reason.to_string()),
        };
        let encoded = serde_json::to_string(&dead).map_err(BusError::Encode)?;
        self.store.push(&self.config.dead_letter_queue, encoded).await?;
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current queue depths.
    pub async fn stats(&self) -> Result<QueueStats, BusError> {
        Ok(QueueStats {
            default: self.store.list_len(&self.config.default_queue).await?,
            high: self.store.list_len(&self.config.high_queue).await?,
            critical: self.store.list_len(&self.config.critical_queue).await?,
            dlq: self.store.list_len(&self.config.dead_letter_queue).await?,
        })
    }

    /// Read up to `limit` dead letters without removing them.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BusError> {
        let raws = self
            .store
            .list_range(&self.config.dead_letter_queue, limit)
            .await?;
        Ok(raws
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    /// Read up to `limit` audit entries, oldest first.
    pub async fn audit_log(&self, limit: usize) -> Result<Vec<AuditEntry>, BusError> {
        let raws = self.store.list_range(&self.config.audit_key, limit).await?;
        Ok(raws
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    /// Administrative reset: clear queues, DLQ, leases, attempt counters,
    /// idempotency markers, and the audit log.
    pub async fn reset_all(&self) -> Result<ResetSummary, BusError> {
        let before = self.stats().await?.total();
        let mut deleted = 0usize;

        for key in [
            self.config.default_queue.clone(),
            self.config.high_queue.clone(),
            self.config.critical_queue.clone(),
            self.config.dead_letter_queue.clone(),
            self.config.audit_key.clone(),
        ] {
            if self.store.delete(&key).await? {
                deleted += 1;
            }
        }

        for prefix in ["processing:", "attempts:", "idem:"] {
            for key in self.store.scan(prefix).await? {
                if self.store.delete(&key).await? {
                    deleted += 1;
                }
            }
        }

        let after = self.stats().await?.total();
        Ok(ResetSummary {
            before,
            deleted,
            after,
        })
    }

    /// Liveness probe against the backing store.
    pub async fn ping(&self) -> Result<(), BusError> {
        self.store.ping().await?;
        Ok(())
    }

    /// Snapshot of the bus counters.
    pub fn metrics(&self) -> BusMetricsSnapshot {
        let samples = self.metrics.queue_wait_samples.load(Ordering::Relaxed);
        let total = self.metrics.queue_wait_ms_total.load(Ordering::Relaxed);
        BusMetricsSnapshot {
            enqueued: self.metrics.enqueued.load(Ordering::Relaxed),
            deduplicated: self.metrics.deduplicated.load(Ordering::Relaxed),
            consumed: self.metrics.consumed.load(Ordering::Relaxed),
            acknowledged: self.metrics.acknowledged.load(Ordering::Relaxed),
            retried: self.metrics.retried.load(Ordering::Relaxed),
            dead_lettered: self.metrics.dead_lettered.load(Ordering::Relaxed),
            avg_queue_wait_ms: if samples == 0 {
                0.0
            } else {
                total as f64 / samples as f64
            },
        }
    }

    async fn audit(&self, entry: AuditEntry) -> Result<(), BusError> {
        let raw = serde_json::to_string(&entry).map_err(BusError::Encode)?;
        self.store.push(&self.config.audit_key, raw).await?;
        self.store
            .list_trim(&self.config.audit_key, self.config.audit_cap)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
