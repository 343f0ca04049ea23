//! Time-bounded cache of decrypted key material.
//!
//! # Cache keys
//!
//! Entries are addressed as `<keytype>:<tenant>:v<version>` (see
//! [`cache_key`]), so a rotation naturally stops hitting the superseded
//! version's entry. TMK rotation still deletes that entry explicitly to bound
//! how long the old plaintext stays in memory.
//!
//! # Security invariants
//!
//! - Cached plaintext is **never** serialised, logged or written to disk.
//! - Values are [`KeyBytes`](crate::crypto::KeyBytes), which zero themselves
//!   when the entry is replaced, removed or the cache is dropped.

pub mod store;

pub use store::KeyCache;

use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::crypto::KeyType;

/// Build the cache key for `key_type` of `tenant` at `version`.
pub fn cache_key(key_type: KeyType, tenant: &str, version: u32) -> String {
    format!("{key_type}:{tenant}:v{version}")
}

/// Spawn a background task that purges expired entries every `interval`.
///
/// Lazy expiry in [`KeyCache::get`] already hides stale entries; the sweeper
/// additionally releases their memory for keys nobody asks for again.
pub fn sweep_task(cache: KeyCache, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick fires immediately; nothing can have expired yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired().await;
            if purged > 0 {
                debug!(purged, "purged expired key cache entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyBytes;

    #[test]
    fn cache_key_format() {
        assert_eq!(cache_key(KeyType::Tmk, "acme", 3), "TMK:acme:v3");
        assert_eq!(cache_key(KeyType::Kek, "acme", 1), "KEK:acme:v1");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let cache = KeyCache::new(Duration::from_secs(5));
        cache.set(cache_key(KeyType::Tmk, "acme", 1), KeyBytes::generate()).await;

        let handle = sweep_task(cache.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        // Let the sweeper run after its tick.
        tokio::task::yield_now().await;

        assert_eq!(cache.len().await, 0);
        handle.abort();
    }
}
