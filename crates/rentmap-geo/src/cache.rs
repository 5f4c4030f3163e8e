//! Bounded, time-expiring cache for external service results
//!
//! Recency order and capacity eviction come from [`lru::LruCache`]; each entry additionally
//! carries its insertion time so it can be expired lazily on read or in bulk by
//! [`BoundedExpiringCache::sweep_expired`].

use crate::config::CacheConfig;
use instant::Instant;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;

/// A cached value and the moment it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp: Instant,
}

impl<T> CacheEntry<T> {
    #[inline]
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.timestamp) > ttl
    }
}

/// String-keyed LRU cache whose entries expire after a fixed TTL
///
/// Not synchronized: intended for a single owner (wrap it in a lock to share it).
pub struct BoundedExpiringCache<T> {
    entries: LruCache<String, CacheEntry<T>>,
    ttl: Duration,
}

impl<T> BoundedExpiringCache<T> {
    /// Create a cache holding at most `max_entries` (minimum 1) entries for `ttl` each
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    /// Look up a live entry and mark it most recently used
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<&T> {
        self.get_at(key, Instant::now())
    }

    /// Insert or overwrite an entry, evicting the least recently used one when full
    pub fn set(&mut self, key: impl Into<String>, value: T) {
        self.set_at(key.into(), value, Instant::now());
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Whether a live entry exists, without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now(), self.ttl))
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries currently held (possibly including not-yet-swept expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn get_at(&mut self, key: &str, now: Instant) -> Option<&T> {
        let expired = self.entries.peek(key)?.is_expired(now, self.ttl);
        if expired {
            self.entries.pop(key);
            tracing::trace!(key, "Cache entry expired on read");
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub(crate) fn set_at(&mut self, key: String, value: T, now: Instant) {
        let entry = CacheEntry {
            value,
            timestamp: now,
        };
        // push returns the displaced entry: either the old value for this key or the LRU victim
        if let Some((evicted, _)) = self.entries.push(key, entry) {
            tracing::trace!(key = %evicted, "Cache entry displaced");
        }
    }

    pub(crate) fn sweep_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        if !expired.is_empty() {
            tracing::debug!(
                removed = expired.len(),
                remaining = self.len(),
                "Swept expired cache entries"
            );
        }
        expired.len()
    }
}

impl<T> std::fmt::Debug for BoundedExpiringCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedExpiringCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_get_missing() {
        let mut cache: BoundedExpiringCache<u32> = BoundedExpiringCache::new(2, TTL);
        assert_eq!(cache.get("nope"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_scenario_touch_protects_from_eviction() {
        let mut cache = BoundedExpiringCache::new(2, TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get("a"), Some(&1));
        cache.set("c", 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(&1));
        assert_eq!(cache.get("c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let max = 5;
        let mut cache = BoundedExpiringCache::new(max, TTL);
        for i in 0..=max {
            cache.set(format!("k{i}"), i);
        }
        assert_eq!(cache.len(), max);
        assert_eq!(cache.get("k0"), None);
        for i in 1..=max {
            assert_eq!(cache.get(&format!("k{i}")), Some(&i));
        }
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = BoundedExpiringCache::new(2, TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(&10));
        assert_eq!(cache.get("b"), Some(&2));

        // Reading "b" last left "a" as the least recently used key
        cache.set("c", 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(&2));
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let mut cache = BoundedExpiringCache::new(4, TTL);
        let t0 = Instant::now();
        cache.set_at("route".to_string(), "payload", t0);

        assert_eq!(cache.get_at("route", t0 + TTL), Some(&"payload"));
        assert_eq!(cache.get_at("route", t0 + TTL + Duration::from_millis(1)), None);
        assert_eq!(cache.len(), 0);
        // Still a miss afterwards, even at an earlier instant
        assert_eq!(cache.get_at("route", t0), None);
    }

    #[test]
    fn test_reset_timestamp_on_overwrite() {
        let mut cache = BoundedExpiringCache::new(4, TTL);
        let t0 = Instant::now();
        cache.set_at("k".to_string(), 1, t0);
        cache.set_at("k".to_string(), 2, t0 + Duration::from_secs(50));
        assert_eq!(cache.get_at("k", t0 + Duration::from_secs(100)), Some(&2));
    }

    #[test]
    fn test_sweep_expired() {
        let mut cache = BoundedExpiringCache::new(10, TTL);
        let t0 = Instant::now();
        cache.set_at("old-1".to_string(), 1, t0);
        cache.set_at("old-2".to_string(), 2, t0);
        cache.set_at("fresh".to_string(), 3, t0 + Duration::from_secs(30));

        assert_eq!(cache.sweep_expired_at(t0 + Duration::from_secs(61)), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("fresh", t0 + Duration::from_secs(61)), Some(&3));
        assert_eq!(cache.sweep_expired_at(t0 + Duration::from_secs(61)), 0);
    }

    #[test]
    fn test_clear_and_contains() {
        let mut cache = BoundedExpiringCache::new(3, TTL);
        cache.set("a", 1);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = BoundedExpiringCache::new(0, TTL);
        assert_eq!(cache.capacity(), 1);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(&2));
    }

    #[test]
    fn test_from_config() {
        let cache: BoundedExpiringCache<()> =
            BoundedExpiringCache::from_config(&CacheConfig::default());
        assert_eq!(cache.capacity(), 100);
        assert_eq!(cache.ttl(), Duration::from_secs(3600));
    }
}
