//! Short-TTL response cache for idempotent GETs.
//!
//! getattr/readdir traffic tends to hammer the same items in bursts;
//! a few seconds of caching absorbs that without risking staleness the
//! delta loop would not fix anyway. Mutations invalidate the affected
//! item's entries immediately.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(4);

/// A keyed JSON response cache with per-entry expiry.
pub struct ResponseCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, serde_json::Value)>,
}

impl ResponseCache {
    /// Cache with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Cache with a custom TTL (tests use tiny values).
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Look up a fresh entry.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        let (stored_at, value) = entry.value();
        if stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    /// Store a response.
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(key.into(), (Instant::now(), value));
    }

    /// Drop every entry whose key contains `fragment` (an item id);
    /// called after any mutation of that item.
    pub fn invalidate(&self, fragment: &str) {
        self.entries.retain(|key, _| !key.contains(fragment));
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of live entries (expired ones may still be counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_roundtrip() {
        let cache = ResponseCache::new();
        cache.put("item:A1", json!({"id": "A1"}));
        assert_eq!(cache.get("item:A1").unwrap()["id"], "A1");
        assert!(cache.get("item:A2").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = ResponseCache::with_ttl(Duration::from_millis(10));
        cache.put("item:A1", json!(1));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("item:A1").is_none());
    }

    #[test]
    fn test_invalidate_by_fragment() {
        let cache = ResponseCache::new();
        cache.put("item:A1", json!(1));
        cache.put("children:A1", json!(2));
        cache.put("item:B2", json!(3));

        cache.invalidate("A1");
        assert!(cache.get("item:A1").is_none());
        assert!(cache.get("children:A1").is_none());
        assert!(cache.get("item:B2").is_some());
    }

    #[test]
    fn test_clear() {
        let cache = ResponseCache::new();
        cache.put("a", json!(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
