//! In-process list store — for tests and single-process deployments.

use async_trait::async_trait;
use chatline_core::cache::{ListStore, resolve_range};
use chatline_core::error::CacheError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry {
    values: Vec<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// A list store held in a map behind one lock.
///
/// Holding the write lock for the whole of `push_trim_expire` makes it one
/// atomic unit. Expired keys are dropped lazily on access.
pub struct InMemoryListStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryListStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }
}

impl Default for InMemoryListStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListStore for InMemoryListStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push_trim_expire(
        &self,
        key: &str,
        values: Vec<String>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            values: Vec::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.values.clear();
        }
        entry.values.extend(values);
        entry.expires_at = Some(now + ttl);
        if max_len > 0 && entry.values.len() > max_len {
            let overflow = entry.values.len() - max_len;
            entry.values.drain(..overflow);
        }
        Ok(())
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(key).filter(|e| e.is_live(now)) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(entry.values.len(), start, stop) {
            Some((from, to)) => entry.values[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn len(&self, key: &str) -> Result<usize, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map_or(0, |e| e.values.len()))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(true),
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(e) if e.is_live(now) => {
                e.expires_at = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn vals(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn push_then_range() {
        let store = InMemoryListStore::new();
        store.push_trim_expire("k", vals(&["a", "b", "c"]), 0, DAY).await.unwrap();
        assert_eq!(store.range("k", 0, -1).await.unwrap(), vals(&["a", "b", "c"]));
        assert_eq!(store.range("k", -2, -1).await.unwrap(), vals(&["b", "c"]));
        assert_eq!(store.len("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn trims_oldest_first() {
        let store = InMemoryListStore::new();
        for v in ["1", "2", "3", "4", "5"] {
            store.push_trim_expire("k", vals(&[v]), 3, DAY).await.unwrap();
        }
        assert_eq!(store.range("k", 0, -1).await.unwrap(), vals(&["3", "4", "5"]));
    }

    #[tokio::test]
    async fn absent_key_is_empty_not_error() {
        let store = InMemoryListStore::new();
        assert!(store.range("missing", 0, -1).await.unwrap().is_empty());
        assert_eq!(store.len("missing").await.unwrap(), 0);
        assert!(!store.exists("missing").await.unwrap());
        assert!(!store.expire("missing", DAY).await.unwrap());
        store.delete("missing").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_behaves_as_absent() {
        let store = InMemoryListStore::new();
        store
            .push_trim_expire("k", vals(&["a"]), 0, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.len("k").await.unwrap(), 0);

        // A push after expiry starts a fresh list.
        store
            .push_trim_expire("k", vals(&["b"]), 0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.range("k", 0, -1).await.unwrap(), vals(&["b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn push_and_expire_slide_the_ttl() {
        let store = InMemoryListStore::new();
        let ttl = Duration::from_secs(10);
        store.push_trim_expire("k", vals(&["a"]), 0, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.push_trim_expire("k", vals(&["b"]), 0, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("k").await.unwrap());

        assert!(store.expire("k", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.len("k").await.unwrap(), 2);
        assert_eq!(store.key_count().await, 1);
    }
}
