//! Bounded object cache.
//!
//! A key/value store with caller-declared entry costs. The sum of all stored
//! costs never exceeds the configured capacity: inserting past the limit
//! evicts least-recently-used entries first. Entries may carry an expiry and
//! are dropped lazily on read or by [`BoundedCache::purge_expired`].

use std::num::NonZeroU64;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::error::CacheError;
use super::lock::mutex_lock;

const METRIC_HIT: &str = "tiercache_cache_hit_total";
const METRIC_MISS: &str = "tiercache_cache_miss_total";
const METRIC_EVICT: &str = "tiercache_cache_evict_total";
const METRIC_EXPIRED: &str = "tiercache_cache_expired_total";

/// A stored value together with its accounting data.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    cost: u64,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Point-in-time statistics for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_cost: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct StoreState<V> {
    entries: LruCache<String, CacheEntry<V>>,
    total_cost: u64,
}

impl<V> StoreState<V> {
    fn take(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.total_cost -= entry.cost;
        Some(entry)
    }
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Miss,
}

/// Fixed-capacity cache with cost accounting and LRU eviction.
pub struct BoundedCache<V> {
    name: &'static str,
    capacity: u64,
    track_statistics: bool,
    state: Mutex<StoreState<V>>,
    counters: Counters,
}

impl<V> BoundedCache<V> {
    /// Create an empty cache holding at most `capacity` cost units.
    pub fn new(name: &'static str, capacity: NonZeroU64) -> Self {
        Self {
            name,
            capacity: capacity.get(),
            track_statistics: true,
            state: Mutex::new(StoreState {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Enable or disable hit/miss/eviction tracking.
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.track_statistics = enabled;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Look up a live entry, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, self.name, "get");

        let lookup = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Lookup::Hit(entry.value.clone()),
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit(value) => {
                drop(state);
                self.record(&self.counters.hits, METRIC_HIT, 1);
                Some(value)
            }
            Lookup::Expired => {
                state.take(key);
                drop(state);
                self.record(&self.counters.expirations, METRIC_EXPIRED, 1);
                self.record(&self.counters.misses, METRIC_MISS, 1);
                None
            }
            Lookup::Miss => {
                drop(state);
                self.record(&self.counters.misses, METRIC_MISS, 1);
                None
            }
        }
    }

    /// Copy of a live entry without touching recency or statistics.
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry<V>>
    where
        V: Clone,
    {
        let now = Instant::now();
        let state = mutex_lock(&self.state, self.name, "peek_entry");
        state
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Whether a live entry exists, without touching recency or statistics.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let state = mutex_lock(&self.state, self.name, "contains");
        state
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Store `value` under `key` with the caller-declared `cost`.
    ///
    /// Returns the number of entries evicted to make room. An entry costing
    /// more than the whole capacity is rejected; any previous value for the
    /// key is dropped in that case as well.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: V,
        cost: u64,
        ttl: Option<Duration>,
    ) -> Result<usize, CacheError> {
        let key = key.into();
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, self.name, "set");

        state.take(&key);

        if cost > self.capacity {
            return Err(CacheError::CapacityExceeded {
                key,
                cost,
                capacity: self.capacity,
            });
        }

        let mut evicted = 0;
        while state.total_cost.saturating_add(cost) > self.capacity {
            match state.entries.pop_lru() {
                Some((evicted_key, entry)) => {
                    state.total_cost -= entry.cost;
                    evicted += 1;
                    debug!(cache = self.name, key = %evicted_key, "evicted entry");
                }
                None => break,
            }
        }

        state.total_cost += cost;
        state.entries.put(
            key,
            CacheEntry {
                value,
                cost,
                created_at: now,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        drop(state);

        self.record(&self.counters.evictions, METRIC_EVICT, evicted as u64);
        Ok(evicted)
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        mutex_lock(&self.state, self.name, "remove")
            .take(key)
            .is_some()
    }

    /// Remove every entry matching `predicate`. Returns how many were removed.
    pub fn remove_where(&self, predicate: impl Fn(&str, &V) -> bool) -> usize {
        let mut state = mutex_lock(&self.state, self.name, "remove_where");
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            state.take(key);
        }
        doomed.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, self.name, "purge_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.take(key);
        }
        drop(state);

        self.record(
            &self.counters.expirations,
            METRIC_EXPIRED,
            expired.len() as u64,
        );
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, self.name, "clear");
        state.entries.clear();
        state.total_cost = 0;
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, self.name, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        mutex_lock(&self.state, self.name, "total_cost").total_cost
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, total_cost) = {
            let state = mutex_lock(&self.state, self.name, "stats");
            (state.entries.len(), state.total_cost)
        };

        CacheStats {
            entry_count,
            total_cost,
            capacity: self.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn record(&self, slot: &AtomicU64, metric: &'static str, amount: u64) {
        if !self.track_statistics || amount == 0 {
            return;
        }
        slot.fetch_add(amount, Ordering::Relaxed);
        counter!(metric, "cache" => self.name).increment(amount);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;

    use super::*;

    fn cache(capacity: u64) -> BoundedCache<String> {
        BoundedCache::new("test", NonZeroU64::new(capacity).expect("non-zero"))
    }

    #[test]
    fn get_after_set_roundtrip() {
        let cache = cache(10);
        assert!(cache.get("a").is_none());

        cache.set("a", "alpha".to_string(), 1, None).expect("fits");

        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        assert_eq!(cache.total_cost(), 1);
    }

    #[test]
    fn evicts_least_recently_used_when_full() {
        let cache = cache(3);
        cache.set("a", "1".into(), 1, None).expect("fits");
        cache.set("b", "2".into(), 1, None).expect("fits");
        cache.set("c", "3".into(), 1, None).expect("fits");

        // Touch `a` so `b` becomes the oldest.
        assert!(cache.get("a").is_some());

        let evicted = cache.set("d", "4".into(), 1, None).expect("fits");
        assert_eq!(evicted, 1);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn large_entry_evicts_several() {
        let cache = cache(4);
        for key in ["a", "b", "c", "d"] {
            cache.set(key, key.to_string(), 1, None).expect("fits");
        }

        let evicted = cache.set("big", "B".into(), 3, None).expect("fits");
        assert_eq!(evicted, 3);
        assert_eq!(cache.total_cost(), 4);
        assert!(cache.contains("d"));
        assert!(cache.contains("big"));
    }

    #[test]
    fn oversized_entry_is_rejected_without_evicting() {
        let cache = cache(5);
        cache.set("a", "1".into(), 2, None).expect("fits");
        cache.set("b", "2".into(), 2, None).expect("fits");

        let err = cache.set("huge", "x".into(), 6, None).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityExceeded {
                key: "huge".into(),
                cost: 6,
                capacity: 5,
            }
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn oversized_replacement_drops_previous_value() {
        let cache = cache(5);
        cache.set("a", "old".into(), 1, None).expect("fits");

        assert!(cache.set("a", "new".into(), 9, None).is_err());
        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn replacing_a_key_releases_its_cost() {
        let cache = cache(4);
        cache.set("a", "1".into(), 3, None).expect("fits");
        cache.set("a", "2".into(), 4, None).expect("fits");

        assert_eq!(cache.total_cost(), 4);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn total_cost_never_exceeds_capacity() {
        let cache = cache(7);
        for i in 0..200_u64 {
            let cost = i % 5 + 1;
            cache
                .set(format!("k{}", i % 13), i.to_string(), cost, None)
                .expect("cost below capacity");
            assert!(cache.total_cost() <= cache.capacity());
            if i % 3 == 0 {
                let _ = cache.get(&format!("k{}", i % 7));
            }
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = cache(2);
        cache.set("a", "1".into(), 1, None).expect("fits");

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(!cache.remove("never-there"));
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn remove_where_filters_by_key() {
        let cache = cache(10);
        cache.set("GET:/a", "1".into(), 1, None).expect("fits");
        cache.set("GET:/a?x=1", "2".into(), 1, None).expect("fits");
        cache.set("GET:/b", "3".into(), 1, None).expect("fits");

        let removed = cache.remove_where(|key, _| key.starts_with("GET:/a"));
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 1);
    }

    #[test]
    fn statistics_count_hits_misses_evictions() {
        let cache = cache(1);
        assert!(cache.get("a").is_none());
        cache.set("a", "1".into(), 1, None).expect("fits");
        assert!(cache.get("a").is_some());
        cache.set("b", "2".into(), 1, None).expect("fits");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.capacity, 1);
    }

    #[test]
    fn statistics_can_be_disabled() {
        let cache = cache(1).with_statistics(false);
        assert!(cache.get("a").is_none());
        cache.set("a", "1".into(), 1, None).expect("fits");
        assert!(cache.get("a").is_some());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions), (0, 0, 0));
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = cache(4);
        cache
            .set("a", "1".into(), 1, Some(Duration::from_secs(30)))
            .expect("fits");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_cost(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_sweeps_only_stale_entries() {
        let cache = cache(4);
        cache
            .set("short", "1".into(), 1, Some(Duration::from_secs(5)))
            .expect("fits");
        cache
            .set("long", "2".into(), 1, Some(Duration::from_secs(60)))
            .expect("fits");
        cache.set("forever", "3".into(), 1, None).expect("fits");

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_cost(), 2);
    }

    #[test]
    fn peek_entry_exposes_accounting() {
        let cache = cache(4);
        cache.set("a", "1".into(), 3, None).expect("fits");

        let entry = cache.peek_entry("a").expect("present");
        assert_eq!(entry.cost(), 3);
        assert_eq!(entry.value(), "1");
        assert!(entry.expires_at().is_none());
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn concurrent_writers_keep_accounting_consistent() {
        let cache = Arc::new(cache(16));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500_u64 {
                        let key = format!("w{worker}-{}", i % 10);
                        cache
                            .set(key.clone(), i.to_string(), i % 3 + 1, None)
                            .expect("fits");
                        let _ = cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker");
        }

        assert!(cache.total_cost() <= 16);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let cache = cache(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache.state.lock().expect("state lock");
            panic!("poison store lock");
        }));

        cache.set("a", "1".into(), 1, None).expect("fits");
        assert!(cache.get("a").is_some());
    }
}
