//! Shared key/value store for handlers.
//!
//! One map behind one async mutex. Controllers hold the lock for the whole
//! batch of handlers run for a single completion, so a handler can read,
//! modify and write a key without further coordination.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

/// Contents of the shared store.
pub type StoreMap = HashMap<String, Value>;

/// Cloneable handle to the shared store.
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    inner: Arc<Mutex<StoreMap>>,
}

impl SharedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the value stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Stores `value` under `key` and returns the previous value.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.lock().await.insert(key.into(), value.into())
    }

    /// Removes `key` and returns its value.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.remove(key)
    }

    /// Locks the store for a sequence of operations.
    pub async fn lock(&self) -> MutexGuard<'_, StoreMap> {
        self.inner.lock().await
    }

    /// Returns a copy of the whole map.
    pub async fn snapshot(&self) -> StoreMap {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_returns_previous_value() {
        let store = SharedStore::new();

        assert_eq!(store.set("count", 1).await, None);
        assert_eq!(store.set("count", 2).await, Some(json!(1)));
        assert_eq!(store.get("count").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn clones_share_the_map() {
        let store = SharedStore::new();
        let other = store.clone();

        other.set("token", "abc").await;

        assert_eq!(store.get("token").await, Some(json!("abc")));
        assert_eq!(store.snapshot().await.len(), 1);
        assert_eq!(store.remove("token").await, Some(json!("abc")));
        assert_eq!(store.get("token").await, None);
    }

    #[tokio::test]
    async fn guarded_read_modify_write_does_not_interleave() {
        let store = SharedStore::new();
        store.set("count", 0).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut map = store.lock().await;
                    let current = map.get("count").and_then(Value::as_u64).unwrap_or(0);
                    tokio::task::yield_now().await;
                    map.insert("count".to_string(), json!(current + 1));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("count").await, Some(json!(400)));
    }
}
