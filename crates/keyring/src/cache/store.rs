//! [`KeyCache`]: thread-safe, time-bounded cache of decrypted key material.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::crypto::KeyBytes;

struct CachedKey {
    key: KeyBytes,
    inserted_at: Instant,
}

/// Process-local cache mapping a cache key to plaintext key bytes.
///
/// Every entry lives for the TTL fixed at construction. An expired entry is
/// treated as absent by [`KeyCache::get`] and removed lazily; the optional
/// sweeper from [`super::sweep_task`] removes the rest.
///
/// Locks are held only for the map operation itself, never across a KMS or
/// database call. Values are cloned out; callers drop their clone promptly
/// and it is zeroed on drop.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<RwLock<HashMap<String, CachedKey>>>,
    ttl: Duration,
}

impl KeyCache {
    /// Create an empty cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace the entry for `key`, restarting its TTL.
    pub async fn set(&self, key: impl Into<String>, value: KeyBytes) {
        let entry = CachedKey {
            key: value,
            inserted_at: Instant::now(),
        };
        self.inner.write().await.insert(key.into(), entry);
    }

    /// Return a copy of the cached key, or `None` if absent or expired.
    pub async fn get(&self, key: &str) -> Option<KeyBytes> {
        {
            let map = self.inner.read().await;
            match map.get(key) {
                None => return None,
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.key.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: drop it under a separate write lock, re-checking in case
        // another task refreshed the entry in between.
        let mut map = self.inner.write().await;
        if map
            .get(key)
            .is_some_and(|entry| entry.inserted_at.elapsed() >= self.ttl)
        {
            map.remove(key);
        }
        None
    }

    pub async fn delete(&self, key: &str) {
        self.inner.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Number of entries currently held, including not-yet-swept expired ones.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - map.len()
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Entry names reveal tenant ids; keep them out of debug output too.
        f.debug_struct("KeyCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}
