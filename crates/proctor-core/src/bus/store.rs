//! Backing-store protocol for the bus and shared state.
//!
//! The bus needs a small set of primitives: atomic list push and blocking
//! multi-key pop in strict key order, set-if-absent with TTL, key delete,
//! atomic increment, prefix scan, list length, and list trim. Anything
//! providing these can back the bus; [`MemoryStore`] is the in-process
//! implementation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Errors surfaced by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Protocol contract for the bus backing store.
///
/// Lists are FIFO: `push` appends at the tail, `pop_first` removes from the
/// head. Value keys carry an optional TTL and expire lazily.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a value to the tail of a list.
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Pop the head of the first non-empty list among `keys`, checked in
    /// order. Blocks until a value arrives or `timeout` elapses; a timeout
    /// returns `Ok(None)`, not an error. Returns `(key, value)`.
    async fn pop_first(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Set a value key, replacing any existing value.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a value key only if it is absent (or expired). Returns `true`
    /// when the value was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read a value key. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a value key or a whole list. Returns `true` if something was
    /// removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increment an integer value key, refreshing its TTL.
    /// Missing or expired keys start from zero. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// List all live value keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Length of a list (0 for a missing key).
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Trim a list to its most recent `max_len` entries.
    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError>;

    /// Read up to `limit` entries from the head of a list.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

// Compile-time assertion: QueueStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn QueueStore) {}
};

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, ValueEntry>,
}

/// In-process [`QueueStore`] backed by tokio primitives.
///
/// Pushes wake blocked poppers through a [`Notify`]; value TTLs expire
/// lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            inner.lists.entry(key.to_string()).or_default().push_back(value);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_first(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking so a push between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                for key in keys {
                    if let Some(list) = inner.lists.get_mut(*key) {
                        if let Some(value) = list.pop_front() {
                            return Ok(Some((key.to_string(), value)));
                        }
                    }
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.values.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: expiry(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.values.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let removed_value = inner.values.remove(key).is_some();
        let removed_list = inner.lists.remove(key).is_some();
        Ok(removed_value || removed_list)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let current = match inner.values.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.value.parse::<u64>().unwrap_or(0)
            }
            _ => 0,
        };
        let next = current + 1;
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: next.to_string(),
                expires_at: expiry(Some(ttl)),
            },
        );
        Ok(next)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.values.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.lists.get_mut(key) {
            while list.len() > max_len {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let store = MemoryStore::new();
        store.push("q", "a".to_string()).await.unwrap();
        store.push("q", "b".to_string()).await.unwrap();

        let (key, value) = store
            .pop_first(&["q"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "q");
        assert_eq!(value, "a");

        let (_, value) = store
            .pop_first(&["q"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, "b");
    }

    #[tokio::test]
    async fn pop_first_honors_key_order() {
        let store = MemoryStore::new();
        store.push("low", "l".to_string()).await.unwrap();
        store.push("high", "h".to_string()).await.unwrap();

        let (key, value) = store
            .pop_first(&["high", "low"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "high");
        assert_eq!(value, "h");
    }

    #[tokio::test]
    async fn pop_first_times_out_with_none() {
        let store = MemoryStore::new();
        let result = store
            .pop_first(&["empty"], Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn pop_first_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());

        let popper = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                store.pop_first(&["q"], Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("q", "late".to_string()).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped, Some(("q".to_string(), "late".to_string())));
    }

    #[tokio::test]
    async fn set_if_absent_collides_until_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "1".to_string(), Duration::from_millis(30))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "2".to_string(), Duration::from_millis(30))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_if_absent("k", "3".to_string(), Duration::from_millis(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn get_hides_expired_values() {
        let store = MemoryStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_starts_from_zero_and_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.incr("n", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.incr("n", Duration::from_secs(60)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scan_returns_matching_live_keys() {
        let store = MemoryStore::new();
        store.set("a:1", "x".to_string(), None).await.unwrap();
        store.set("a:2", "y".to_string(), None).await.unwrap();
        store.set("b:1", "z".to_string(), None).await.unwrap();

        let keys = store.scan("a:").await.unwrap();
        assert_eq!(keys, vec!["a:1".to_string(), "a:2".to_string()]);
    }

    #[tokio::test]
    async fn list_trim_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.push("l", format!("{i}")).await.unwrap();
        }
        store.list_trim("l", 2).await.unwrap();

        let entries = store.list_range("l", 10).await.unwrap();
        assert_eq!(entries, vec!["3".to_string(), "4".to_string()]);
        assert_eq!(store.list_len("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_removes_values_and_lists() {
        let store = MemoryStore::new();
        store.set("v", "x".to_string(), None).await.unwrap();
        store.push("l", "y".to_string()).await.unwrap();

        assert!(store.delete("v").await.unwrap());
        assert!(store.delete("l").await.unwrap());
        assert!(!store.delete("v").await.unwrap());
        assert_eq!(store.get("v").await.unwrap(), None);
        assert_eq!(store.list_len("l").await.unwrap(), 0);
    }
}
