//! Key-value store abstraction for cursors, throttles and retry counters.
//!
//! All shared mutable state that outlives a single task (admission slots,
//! reason-code retry counters) lives behind [`KeyValueStore`]. Keys are built
//! with [`namespaced_key`] so state for one subject never collides with
//! another's.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builds a `namespace:scope:name` key.
#[must_use]
pub fn namespaced_key(namespace: &str, scope: &str, name: &str) -> String {
    format!("{namespace}:{scope}:{name}")
}

/// Protocol for key-value storage backends with per-entry TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Gets a value by key, ignoring expired entries.
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Sets a value with an optional TTL.
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);

    /// Deletes a value.
    async fn delete(&self, key: &str);

    /// Atomically adds `delta` to an integer counter and returns the new
    /// value. A missing or expired key starts at zero. The TTL is applied
    /// only when the counter is created.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64;
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory key-value store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryKeyValueStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Returns true if the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.is_expired(now) {
                entries.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }

        None
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                let next = entry.value.as_i64().unwrap_or(0) + delta;
                entry.value = serde_json::json!(next);
                next
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: serde_json::json!(delta),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                delta
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key() {
        assert_eq!(
            namespaced_key("retry", "post-1", "media_not_ready"),
            "retry:post-1:media_not_ready"
        );
    }

    #[tokio::test]
    async fn test_in_memory_store_basic() {
        let store = InMemoryKeyValueStore::new();
        assert!(store.is_empty());

        store.set("key1", serde_json::json!("v"), None).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("key1").await, Some(serde_json::json!("v")));

        store.delete("key1").await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let store = InMemoryKeyValueStore::new();
        store
            .set("gone", serde_json::json!(1), Some(Duration::ZERO))
            .await;

        assert!(store.get("gone").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_counts() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.increment("c", 1, None).await, 1);
        assert_eq!(store.increment("c", 1, None).await, 2);
        assert_eq!(store.increment("c", -1, None).await, 1);
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let store = InMemoryKeyValueStore::new();
        store.increment("c", 5, Some(Duration::ZERO)).await;
        assert_eq!(store.increment("c", 1, None).await, 1);
    }
}
