//! Idempotency cache (in-memory only, lost on restart).
//!
//! Keyed by request identifier; holds the `data` payload of successful
//! replies for one TTL window.  Error replies are never inserted, so a
//! retried identifier that previously failed is forwarded again.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Option<serde_json::Value>,
    inserted_at: Instant,
}

/// Thread-safe success-reply cache with time-based reclamation.
#[derive(Clone)]
pub struct IdempotencyCache {
    ttl: Duration,
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record the success payload for `request_id`.  Re-inserting the same
    /// identifier refreshes its window.
    pub fn insert(&self, request_id: &str, data: Option<serde_json::Value>) {
        let mut inner = self.inner.write().unwrap();
        // Opportunistic sweep keeps the map dominated by live windows.
        let ttl = self.ttl;
        inner.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        inner.insert(
            request_id.to_owned(),
            CacheEntry {
                data,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Replay payload for `request_id`, if it completed successfully within
    /// the TTL window.  The outer `Option` is the hit/miss; the inner one is
    /// the (possibly absent) `data` of the original reply.
    pub fn get(&self, request_id: &str) -> Option<Option<serde_json::Value>> {
        let inner = self.inner.read().unwrap();
        let entry = inner.get(request_id)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            debug!(request_id, "cache entry expired");
            return None;
        }
        Some(entry.data.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_returns_original_payload() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        cache.insert("c1:r1", Some(json!({ "v": 1 })));
        assert_eq!(cache.get("c1:r1"), Some(Some(json!({ "v": 1 }))));
    }

    #[test]
    fn miss_on_unknown_identifier() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("c1:r1"), None);
    }

    #[test]
    fn success_without_data_still_replays() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        cache.insert("c1:r1", None);
        assert_eq!(cache.get("c1:r1"), Some(None));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(Duration::from_millis(20));
        cache.insert("c1:r1", Some(json!(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("c1:r1"), None);
    }

    #[test]
    fn insert_sweeps_expired_entries() {
        let cache = IdempotencyCache::new(Duration::from_millis(20));
        cache.insert("c1:r1", Some(json!(1)));
        cache.insert("c1:r2", Some(json!(2)));
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("c1:r3", Some(json!(3)));
        assert_eq!(cache.len(), 1, "sweep should drop the expired windows");
        assert_eq!(cache.get("c1:r3"), Some(Some(json!(3))));
    }
}
