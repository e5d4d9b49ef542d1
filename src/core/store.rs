//! Shared state store
//!
//! Rate-limit counters, API key usage and breaker state all live behind
//! [`StateStore`]. The in-process [`MemoryStore`] is the default; any backend
//! offering the same four primitives keeps per-key updates atomic, because
//! the algorithms only ever mutate state through [`update_json`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{de::DeserializeOwned, Serialize};

use super::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> GatewayResult<()>;

    /// Atomically adds `delta` to an integer counter, creating it at zero.
    async fn incr(&self, key: &str, delta: i64) -> GatewayResult<i64>;

    /// Replaces the value only if it still equals `expected`
    /// (`None` meaning the key must be absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> GatewayResult<bool>;
}

/// Builds the store named by `gateway.store_url`.
pub fn build_store(url: Option<&str>) -> GatewayResult<Arc<dyn StateStore>> {
    match url {
        None => Ok(Arc::new(MemoryStore::default())),
        Some(url) if url.starts_with("memory://") => Ok(Arc::new(MemoryStore::default())),
        Some(url) => Err(GatewayError::Configuration(format!(
            "Unsupported state store: {url}"
        ))),
    }
}

/// Per-process store; each key is guarded by its DashMap shard lock.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Bytes>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> GatewayResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> GatewayResult<i64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = std::str::from_utf8(entry.get())
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        GatewayError::Internal(format!("Value at '{key}' is not an integer"))
                    })?;
                let next = current + delta;
                entry.insert(Bytes::from(next.to_string()));
                Ok(next)
            }
            Entry::Vacant(entry) => {
                entry.insert(Bytes::from(delta.to_string()));
                Ok(delta)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> GatewayResult<bool> {
        match (self.entries.entry(key.to_string()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if entry.get().as_ref() == expected => {
                entry.insert(value);
                Ok(true)
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Read-modify-write of a JSON record with a compare-and-swap retry loop.
///
/// `update` receives the current record (or `None`) and returns the record to
/// store plus a value handed back to the caller. It may run more than once.
pub async fn update_json<T, R, F>(store: &dyn StateStore, key: &str, mut update: F) -> GatewayResult<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> (T, R),
{
    loop {
        let current = store.get(key).await?;
        let record = match &current {
            Some(raw) => Some(serde_json::from_slice::<T>(raw).map_err(|e| {
                GatewayError::Internal(format!("Corrupt state at '{key}': {e}"))
            })?),
            None => None,
        };

        let (next, output) = update(record);
        let encoded = serde_json::to_vec(&next)
            .map_err(|e| GatewayError::Internal(format!("Unable to encode '{key}': {e}")))?;

        if store
            .compare_and_swap(key, current.as_deref(), Bytes::from(encoded))
            .await?
        {
            return Ok(output);
        }

        log::trace!("CAS conflict on '{key}', retrying");
        tokio::task::yield_now().await;
    }
}

/// Reads and decodes a JSON record without modifying it.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> GatewayResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| GatewayError::Internal(format!("Corrupt state at '{key}': {e}"))),
        None => Ok(None),
    }
}
