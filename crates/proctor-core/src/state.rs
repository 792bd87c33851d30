//! Shared key/value state with TTLs, used for correlation and attempt
//! tracking across agents.
//!
//! Keys are partitioned by owner: the optimizer owns `opt:pending:*` and
//! `execAttempts:*`, the context agent owns `ctx:*`. Values are JSON.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bus::store::{QueueStore, StoreError};

/// Errors from shared-state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode or decode shared-state value: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Configuration for the shared-state store.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Key prefix separating this deployment's keys in the backing store.
    pub prefix: String,
    /// TTL applied when a write does not specify one.
    pub default_ttl: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            prefix: "proctor".to_string(),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Typed JSON view over the backing store.
#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn QueueStore>,
    config: StateConfig,
}

impl SharedState {
    pub fn new(store: Arc<dyn QueueStore>, config: StateConfig) -> Self {
        Self { store, config }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{key}", self.config.prefix)
    }

    /// Read and decode a value. Expired or missing keys read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.store.get(&self.full_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a value. `ttl: None` applies the default TTL.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let raw = serde_json::to_string(value)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.store.set(&self.full_key(key), raw, Some(ttl)).await?;
        Ok(())
    }

    /// Encode and write a value only if the key is absent. Returns `true`
    /// when the value was written.
    pub async fn set_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let raw = serde_json::to_string(value)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        Ok(self.store.set_if_absent(&self.full_key(key), raw, ttl).await?)
    }

    /// Delete a key. Returns `true` if it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.store.delete(&self.full_key(key)).await?)
    }

    /// Atomically increment a counter key, refreshing its TTL.
    pub async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64, StateError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        Ok(self.store.incr(&self.full_key(key), ttl).await?)
    }

    /// List live keys under `key_prefix`, with the deployment prefix
    /// stripped back off.
    pub async fn scan(&self, key_prefix: &str) -> Result<Vec<String>, StateError> {
        let full_prefix = self.full_key(key_prefix);
        let strip = format!("{}:", self.config.prefix);
        let keys = self.store.scan(&full_prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_owned))
            .collect())
    }
}
