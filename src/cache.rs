//! Time-bounded memoization of pipeline stages.
//!
//! Entries are keyed by `(source key, content fingerprint, stage)` and expire
//! at `insertion + ttl`. Expiry is lazy: an expired entry is dropped by the
//! `get` that finds it. [`TtlCache::purge_expired`] exists for an optional
//! background sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::router::RenderPlan;
use crate::schema::SchemaSummary;

pub const STAGE_SCHEMA: &str = "schema";
pub const STAGE_ROUTER: &str = "router";

/// Output of one pipeline stage, as held in the shared cache.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Schema(Arc<SchemaSummary>),
    Plan(Arc<RenderPlan>),
}

pub type StageCache = TtlCache<StageOutput>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_key: String,
    pub fingerprint: String,
    pub stage: &'static str,
}

impl CacheKey {
    pub fn new(source_key: &str, fingerprint: &str, stage: &'static str) -> Self {
        Self {
            source_key: source_key.to_string(),
            fingerprint: fingerprint.to_string(),
            stage,
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn live_at(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently stored, including expired ones not yet evicted.
    pub entries: usize,
}

/// Thread-safe TTL cache. Cloning shares the same backing map.
///
/// Every operation takes the lock once, so individual gets and puts are
/// atomic; concurrent puts to one key resolve last-writer-wins.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    inner: Arc<RwLock<HashMap<CacheKey, Entry<V>>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            default_ttl,
        }
    }

    /// Value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<V> {
        {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(key) {
                Some(entry) if entry.live_at(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: evict unless a writer refreshed it in between.
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get(key) {
            if entry.live_at(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            map.remove(key);
            tracing::debug!("Cache entry expired: {}:{}", key.stage, key.source_key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: CacheKey, value: V, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key, Entry { value, expires_at });
    }

    /// Store with the cache's default TTL.
    pub fn insert(&self, key: CacheKey, value: V) {
        self.put(key, value, self.default_ttl);
    }

    /// Drop one entry. Returns true if it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Evict all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, entry| entry.live_at(now));
        before - map.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stage: &'static str) -> CacheKey {
        CacheKey::new("data/a.json", "abc123", stage)
    }

    #[test]
    fn test_put_and_get() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(key(STAGE_ROUTER), "plan".to_string());

        assert_eq!(cache.get(&key(STAGE_ROUTER)), Some("plan".to_string()));
        assert_eq!(cache.get(&key(STAGE_SCHEMA)), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put(key(STAGE_ROUTER), 1u32, Duration::from_secs(5));

        let later = Instant::now() + Duration::from_secs(6);
        assert_eq!(cache.get_at(&key(STAGE_ROUTER), later), None);
        // Lazily evicted.
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_zero_ttl_never_served() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put(key(STAGE_ROUTER), 1u32, Duration::ZERO);
        assert_eq!(cache.get(&key(STAGE_ROUTER)), None);
    }

    #[test]
    fn test_expiry_after_real_time_passes() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert(key(STAGE_SCHEMA), 7u32);
        assert_eq!(cache.get(&key(STAGE_SCHEMA)), Some(7));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&key(STAGE_SCHEMA)), None);
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let cache = TtlCache::new(Duration::from_secs(u64::MAX));
        cache.insert(key(STAGE_ROUTER), 1u32);
        assert_eq!(cache.get(&key(STAGE_ROUTER)), Some(1));
        assert_eq!(cache.purge_expired(), 0);

        let later = Instant::now() + Duration::from_secs(10 * 365 * 24 * 3600);
        assert_eq!(cache.get_at(&key(STAGE_ROUTER), later), Some(1));
    }

    #[test]
    fn test_fingerprint_change_is_a_different_key() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(CacheKey::new("a.json", "v1", STAGE_ROUTER), 1u32);
        assert_eq!(cache.get(&CacheKey::new("a.json", "v2", STAGE_ROUTER)), None);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(key(STAGE_ROUTER), 1u32);
        cache.insert(key(STAGE_SCHEMA), 2u32);
        cache.insert(CacheKey::new("other.json", "x", STAGE_ROUTER), 3u32);

        assert!(cache.invalidate(&key(STAGE_ROUTER)));
        assert!(!cache.invalidate(&key(STAGE_ROUTER)));
        assert_eq!(cache.stats().entries, 2);

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put(key(STAGE_ROUTER), 1u32, Duration::ZERO);
        cache.put(key(STAGE_SCHEMA), 2u32, Duration::from_secs(60));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(&key(STAGE_SCHEMA)), Some(2));
    }

    #[test]
    fn test_concurrent_writers_do_not_corrupt() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cache.insert(key(STAGE_ROUTER), i);
                        let _ = cache.get(&key(STAGE_ROUTER));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let value = cache.get(&key(STAGE_ROUTER)).unwrap();
        assert!(value < 8);
        assert_eq!(cache.stats().entries, 1);
    }
}
