//! Durable key-value storage behind the queue, the action log and the cache

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

pub mod filesystem;
pub mod memory;

/// Minimal persistence interface
///
/// Every write replaces a whole value; there is no partial update, so a
/// record read back is always one that was written in full.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set (replace) a value
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}

/// Serialize `value` as JSON and store it under `key`
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_string(value)?;
    store.set(key, json).await
}

/// Load and deserialize the JSON value stored under `key`
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Load every JSON value under `prefix`, skipping records that fail to parse
pub async fn load_all<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    prefix: &str,
) -> Result<Vec<T>> {
    let mut values = Vec::new();

    for key in store.keys(prefix).await? {
        let Some(json) = store.get(&key).await? else {
            continue;
        };
        match serde_json::from_str(&json) {
            Ok(value) => values.push(value),
            Err(e) => tracing::error!("Skipping unreadable record {}: {}", key, e),
        }
    }

    Ok(values)
}
