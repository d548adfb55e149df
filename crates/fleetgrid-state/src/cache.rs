//! Cache tier: TTL key/value store in front of the durable store.
//!
//! [`CacheBackend`] is the seam for an external key/value server;
//! [`MemoryCache`] is the in-process implementation used by the daemon
//! and tests. Values are the same JSON bytes stored in redb.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{StateError, StateResult};

/// A key/value cache with per-entry expiry.
pub trait CacheBackend: Send + Sync {
    /// Fetch a live entry. Expired entries read as absent.
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;
    /// Insert or overwrite an entry that expires after `ttl`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StateResult<()>;
    fn invalidate(&self, key: &str) -> StateResult<()>;
    /// Connectivity check.
    fn ping(&self) -> StateResult<()>;
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process TTL cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones that have expired but not
    /// yet been evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

fn poisoned<T>(_: T) -> StateError {
    StateError::Cache("cache lock poisoned".to_string())
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StateResult<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn invalidate(&self, key: &str) -> StateResult<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn ping(&self) -> StateResult<()> {
        self.entries.lock().map(|_| ()).map_err(poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cache = MemoryCache::new();
        cache.set("agent:a", b"{}".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("agent:a").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(cache.get("agent:b").unwrap(), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = MemoryCache::new();
        cache.set("task:t", b"1".to_vec(), Duration::from_secs(60)).unwrap();
        cache.invalidate("task:t").unwrap();
        assert_eq!(cache.get("task:t").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("task:t", b"1".to_vec(), Duration::from_secs(30)).unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("task:t").unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("task:t").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_sweeps_stale_entries() {
        let cache = MemoryCache::new();
        cache.set("a", b"1".to_vec(), Duration::from_secs(10)).unwrap();
        cache.set("b", b"2".to_vec(), Duration::from_secs(100)).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overwrite_replaces_value() {
        let cache = MemoryCache::new();
        cache.set("k", b"old".to_vec(), Duration::from_secs(60)).unwrap();
        cache.set("k", b"new".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(b"new".to_vec()));
    }
}
