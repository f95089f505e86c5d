use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{SharedStore, StoreError, StoreResult};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Process-local fallback for single-process deployments and tests. Mirrors
/// the redis semantics, including TTL expiry, under one mutex.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_window(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let current = Self::live_value(&mut entries, key)
            .map(|value| value.parse::<i64>().unwrap_or(0))
            .unwrap_or(0);
        let next = current + amount;
        let expires_at = match entries.get(key) {
            Some(entry) => entry.expires_at,
            None => Some(Instant::now() + ttl),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        Ok(Self::live_value(&mut entries, key))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let current = Self::live_value(&mut entries, key);
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Command("memory store lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_creates_then_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(
            store.incr_window("k", 1, Duration::from_secs(60)).await.unwrap(),
            1
        );
        assert_eq!(
            store.incr_window("k", 2, Duration::from_secs(60)).await.unwrap(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store.incr_window("k", 1, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(
            store.incr_window("k", 1, Duration::from_secs(5)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cas_requires_exact_expected_value() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("c", None, "a", None).await.unwrap());
        assert!(!store.compare_and_swap("c", None, "b", None).await.unwrap());
        assert!(!store
            .compare_and_swap("c", Some("x"), "b", None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("c", Some("a"), "b", None)
            .await
            .unwrap());
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("b"));
    }
}
