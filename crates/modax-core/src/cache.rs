//! In-process TTL cache
//!
//! Small key→value store with per-entry TTL, hit/miss accounting, and
//! per-device invalidation. Values are owned `serde_json::Value`s so callers
//! never share references into the cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::metrics_names;

struct Entry {
    value: Value,
    expires_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Thread-safe TTL cache. Expiry is lazy on read and opportunistic on write.
pub struct TtlCache {
    name: &'static str,
    inner: Mutex<Inner>,
}

impl TtlCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a key. A lookup that finds no live entry counts as a miss;
    /// an expired entry is removed on the spot.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let live = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        if live.is_some() {
            inner.hits += 1;
            metrics::counter!(metrics_names::CACHE_HITS_TOTAL, "cache" => self.name).increment(1);
        } else {
            inner.misses += 1;
            metrics::counter!(metrics_names::CACHE_MISSES_TOTAL, "cache" => self.name)
                .increment(1);
        }
        live
    }

    /// Insert or replace an entry. Expired entries are swept on every write
    /// to keep the map from accumulating dead keys.
    pub fn put(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.entries.retain(|_, e| e.expires_at > now);
        inner.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        metrics::gauge!(metrics_names::CACHE_SIZE, "cache" => self.name)
            .set(inner.entries.len() as f64);
    }

    /// Remove a single key. Returns whether it was present (live or expired).
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Remove every key containing the device id. Returns the number removed.
    pub fn invalidate_device(&self, device_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.contains(device_id));
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_after_put_hits() {
        let cache = TtlCache::new("test");
        cache.put("status", json!({"ok": true}), Duration::from_secs(60));
        assert_eq!(cache.get("status"), Some(json!({"ok": true})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let cache = TtlCache::new("test");
        cache.put("k", json!(1), Duration::ZERO);
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn hit_rate_is_exact() {
        let cache = TtlCache::new("test");
        cache.put("a", json!(1), Duration::from_secs(60));
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_rate_zero_without_lookups() {
        let cache = TtlCache::new("test");
        assert_eq!(cache.stats().hit_rate, 0.0);
    }

    #[test]
    fn invalidate_device_removes_matching_keys() {
        let cache = TtlCache::new("test");
        cache.put("advisory:D1", json!(1), Duration::from_secs(60));
        cache.put("history:D1", json!(2), Duration::from_secs(60));
        cache.put("advisory:D2", json!(3), Duration::from_secs(60));

        assert_eq!(cache.invalidate_device("D1"), 2);
        assert_eq!(cache.get("advisory:D1"), None);
        assert_eq!(cache.get("advisory:D2"), Some(json!(3)));
    }

    #[test]
    fn put_sweeps_expired_entries() {
        let cache = TtlCache::new("test");
        cache.put("dead", json!(1), Duration::ZERO);
        cache.put("live", json!(2), Duration::from_secs(60));
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn values_are_copies() {
        let cache = TtlCache::new("test");
        cache.put("k", json!({"n": 1}), Duration::from_secs(60));
        let mut v = cache.get("k").unwrap();
        v["n"] = json!(2);
        assert_eq!(cache.get("k").unwrap()["n"], json!(1));
    }
}
