//! Two-level hybrid cache.
//!
//! Tier 1 is an in-process [`BoundedCache`] holding typed values; tier 2 is a
//! shared [`RemoteStore`] holding JSON payloads. Lookups go local, then
//! remote, then compute. Cold keys are resolved by a single flight per key:
//! the first caller spawns the work, everyone else awaits the same shared
//! future.
//!
//! The remote tier is best-effort. When it errors the cache behaves as if the
//! remote tier were empty and keeps serving from the local tier or the
//! computation.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::error::HybridError;
use super::flight::{FlightOutcome, FlightRegistry, Joined, LocalValue};
use super::remote::RemoteStore;
use super::store::{BoundedCache, CacheStats};

const LOCAL_TIER_NAME: &str = "hybrid_local";
const METRIC_REMOTE: &str = "tiercache_hybrid_remote_total";
const METRIC_COMPUTE: &str = "tiercache_hybrid_compute_total";

/// Per-entry expirations and cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    pub local_expiration: Duration,
    pub remote_expiration: Duration,
    /// Cost charged against the local tier's capacity.
    pub cost: u64,
    /// How long a caller waits on another caller's computation.
    pub wait_timeout: Option<Duration>,
}

impl Default for EntryOptions {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self::new(config.local_expiration, config.remote_expiration)
    }
}

impl EntryOptions {
    pub fn new(local_expiration: Duration, remote_expiration: Duration) -> Self {
        Self {
            local_expiration,
            remote_expiration,
            cost: 1,
            wait_timeout: None,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Local lifetime actually applied: never longer than the remote one.
    pub fn effective_local_expiration(&self) -> Duration {
        self.local_expiration.min(self.remote_expiration)
    }
}

/// Counters for the hybrid cache plus its local tier's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HybridStats {
    pub local: CacheStats,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub remote_errors: u64,
    pub computations: u64,
    pub failed_computations: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    remote_errors: AtomicU64,
    computations: AtomicU64,
    failed_computations: AtomicU64,
}

struct Inner {
    local: BoundedCache<LocalValue>,
    remote: Option<Arc<dyn RemoteStore>>,
    flights: FlightRegistry,
    defaults: EntryOptions,
    counters: Counters,
}

/// Local + remote cache with single-flight computation.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<Inner>,
}

impl HybridCache {
    pub fn new(
        local: BoundedCache<LocalValue>,
        remote: Option<Arc<dyn RemoteStore>>,
        defaults: EntryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                flights: FlightRegistry::new(),
                defaults,
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        let local = BoundedCache::new(LOCAL_TIER_NAME, config.object_capacity)
            .with_statistics(config.track_statistics);
        let defaults = EntryOptions::new(config.local_expiration, config.remote_expiration);
        Self::new(local, remote, defaults)
    }

    pub fn default_options(&self) -> EntryOptions {
        self.inner.defaults
    }

    pub fn local_tier(&self) -> &BoundedCache<LocalValue> {
        &self.inner.local
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.flights.contains(key)
    }

    /// [`get_or_compute_with`](Self::get_or_compute_with) using the default options.
    pub async fn get_or_compute<T, F, Fut, E>(&self, key: &str, compute: F) -> Result<T, HybridError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        self.get_or_compute_with(key, self.inner.defaults, compute)
            .await
    }

    /// Return the value for `key`, computing it at most once across
    /// concurrent callers when neither tier has it.
    ///
    /// The computation runs on its own task: a caller that stops waiting
    /// (timeout or drop) leaves it running for the others. Failures are
    /// handed to every current waiter and are not cached.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_or_compute_with<T, F, Fut, E>(
        &self,
        key: &str,
        options: EntryOptions,
        compute: F,
    ) -> Result<T, HybridError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        if let Some(value) = self.inner.local.get(key) {
            if let Some(typed) = value.downcast_ref::<T>() {
                debug!(cache = "hybrid", tier = "local", outcome = "hit");
                return Ok(typed.clone());
            }
            debug!(
                cache = "hybrid",
                tier = "local",
                outcome = "type_mismatch",
                "ignoring local entry of another type"
            );
        }

        let joined = self.inner.flights.join_or_start(key, |guard, invalidated| {
            let inner = Arc::clone(&self.inner);
            let owned_key = key.to_string();
            let task = tokio::spawn(async move {
                let _guard = guard;
                inner
                    .resolve(&owned_key, options, compute, &invalidated)
                    .await
            });

            let owned_key = key.to_string();
            async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        let reason = if err.is_panic() {
                            "computation panicked"
                        } else {
                            "computation was cancelled"
                        };
                        warn!(key = %owned_key, reason, "flight ended abnormally");
                        Err(HybridError::computation_failed(&owned_key, reason))
                    }
                }
            }
            .boxed()
            .shared()
        });

        if matches!(joined, Joined::Waiter(_)) {
            debug!(cache = "hybrid", outcome = "joined_flight");
        }

        let outcome = joined.outcome();
        let resolved = match options.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, outcome).await.map_err(|_| {
                warn!(waited = ?limit, "stopped waiting for in-flight computation");
                HybridError::Timeout {
                    key: key.to_string(),
                    waited: limit,
                }
            })?,
            None => outcome.await,
        }?;

        resolved
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| HybridError::TypeMismatch {
                key: key.to_string(),
            })
    }

    /// Look `key` up in both tiers without computing.
    ///
    /// A remote hit is copied into the local tier with the default options.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.inner.local.get(key) {
            if let Some(typed) = value.downcast_ref::<T>() {
                return Some(typed.clone());
            }
        }

        let value = self.inner.remote_get::<T>(key).await?;
        self.inner
            .local_set(key, Arc::new(value.clone()), self.inner.defaults);
        Some(value)
    }

    /// Write `value` through to both tiers.
    pub async fn set<T>(&self, key: &str, value: T, options: EntryOptions)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.inner.remote_set(key, &value, options).await;
        self.inner.local_set(key, Arc::new(value), options);
    }

    /// Remove `key` from both tiers.
    ///
    /// A computation already running for `key` keeps going and its waiters
    /// still get its value, but the value is not stored.
    pub async fn invalidate(&self, key: &str) {
        let in_flight = self.inner.flights.mark_invalidated(key);
        self.inner.local.remove(key);
        self.inner.remote_remove(key).await;
        debug!(cache = "hybrid", key, in_flight, "invalidated");
    }

    /// Drop expired entries from both tiers.
    pub async fn purge_expired(&self) -> u64 {
        let local = self.inner.local.purge_expired() as u64;
        let remote = match self.inner.remote.as_ref() {
            Some(remote) => remote.purge_expired().await.unwrap_or_else(|err| {
                warn!(error = %err, "remote tier purge failed");
                0
            }),
            None => 0,
        };
        local + remote
    }

    pub fn stats(&self) -> HybridStats {
        let counters = &self.inner.counters;
        HybridStats {
            local: self.inner.local.stats(),
            remote_hits: counters.remote_hits.load(Ordering::Relaxed),
            remote_misses: counters.remote_misses.load(Ordering::Relaxed),
            remote_errors: counters.remote_errors.load(Ordering::Relaxed),
            computations: counters.computations.load(Ordering::Relaxed),
            failed_computations: counters.failed_computations.load(Ordering::Relaxed),
            in_flight: self.inner.flights.len(),
        }
    }
}

impl Inner {
    /// Body of a flight: local re-check, remote lookup, then compute.
    async fn resolve<T, F, Fut, E>(
        &self,
        key: &str,
        options: EntryOptions,
        compute: F,
        invalidated: &AtomicBool,
    ) -> FlightOutcome
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        // A flight that just finished may have filled the local tier between
        // the caller's miss and this flight's registration.
        let filled = self
            .local
            .peek_entry(key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|value| value.is::<T>());
        if let Some(value) = filled {
            return Ok(value);
        }

        if let Some(value) = self.remote_get::<T>(key).await {
            let value: LocalValue = Arc::new(value);
            if !invalidated.load(Ordering::Acquire) {
                self.local_set(key, Arc::clone(&value), options);
                if invalidated.load(Ordering::Acquire) {
                    self.local.remove(key);
                }
            }
            return Ok(value);
        }

        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        let value = match compute().await {
            Ok(value) => {
                counter!(METRIC_COMPUTE, "outcome" => "ok").increment(1);
                value
            }
            Err(err) => {
                self.counters
                    .failed_computations
                    .fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_COMPUTE, "outcome" => "error").increment(1);
                let err = HybridError::computation_failed(key, err);
                warn!(key, error = %err, "computation failed; nothing cached");
                return Err(err);
            }
        };

        if invalidated.load(Ordering::Acquire) {
            debug!(key, "invalidated during computation; result not stored");
            return Ok(Arc::new(value));
        }

        self.remote_set(key, &value, options).await;
        let value: LocalValue = Arc::new(value);
        self.local_set(key, Arc::clone(&value), options);

        // Invalidation raced with the stores above.
        if invalidated.load(Ordering::Acquire) {
            self.local.remove(key);
            self.remote_remove(key).await;
        }

        Ok(value)
    }

    fn local_set(&self, key: &str, value: LocalValue, options: EntryOptions) {
        if let Err(err) = self.local.set(
            key,
            value,
            options.cost,
            Some(options.effective_local_expiration()),
        ) {
            warn!(key, error = %err, "value not cached in local tier");
        }
    }

    async fn remote_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let remote = self.remote.as_ref()?;

        match remote.get(key).await {
            Ok(Some(payload)) => match serde_json::from_slice::<T>(&payload) {
                Ok(value) => {
                    self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_REMOTE, "outcome" => "hit").increment(1);
                    debug!(cache = "hybrid", tier = "remote", outcome = "hit");
                    Some(value)
                }
                Err(err) => {
                    self.counters.remote_misses.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_REMOTE, "outcome" => "miss").increment(1);
                    warn!(key, error = %err, "undecodable remote payload treated as miss");
                    None
                }
            },
            Ok(None) => {
                self.counters.remote_misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_REMOTE, "outcome" => "miss").increment(1);
                debug!(cache = "hybrid", tier = "remote", outcome = "miss");
                None
            }
            Err(err) => {
                self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_REMOTE, "outcome" => "error").increment(1);
                warn!(key, error = %err, "remote tier read failed; treating as miss");
                None
            }
        }
    }

    async fn remote_set<T>(&self, key: &str, value: &T, options: EntryOptions)
    where
        T: Serialize,
    {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };

        let payload = match serde_json::to_vec(value) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                warn!(key, error = %err, "value not serializable; kept in local tier only");
                return;
            }
        };

        if let Err(err) = remote
            .set(key, payload, options.remote_expiration)
            .await
        {
            self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_REMOTE, "outcome" => "error").increment(1);
            warn!(key, error = %err, "remote tier write failed");
        }
    }

    async fn remote_remove(&self, key: &str) {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        if let Err(err) = remote.remove(key).await {
            self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %err, "remote tier delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::remote::MemoryRemoteStore;

    fn hybrid(remote: Option<Arc<dyn RemoteStore>>) -> HybridCache {
        let local = BoundedCache::new("test_local", NonZeroU64::new(8).expect("non-zero"));
        HybridCache::new(local, remote, EntryOptions::default())
    }

    #[tokio::test]
    async fn local_hit_skips_computation() {
        let cache = hybrid(None);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: u32 = cache
                .get_or_compute("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(7)
                })
                .await
                .expect("value");
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().computations, 1);
        assert!(!cache.is_in_flight("k"));
    }

    #[tokio::test]
    async fn computed_value_lands_in_both_tiers() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = hybrid(Some(remote.clone()));

        let value: String = cache
            .get_or_compute("greeting", || async { Ok::<_, String>("hi".to_string()) })
            .await
            .expect("value");

        assert_eq!(value, "hi");
        assert!(cache.local_tier().contains("greeting"));
        let payload = remote.get("greeting").await.expect("get").expect("stored");
        assert_eq!(&payload[..], br#""hi""#);
    }

    #[tokio::test]
    async fn local_expiration_is_clamped_to_remote() {
        let options = EntryOptions::new(Duration::from_secs(90), Duration::from_secs(60));
        assert_eq!(options.effective_local_expiration(), Duration::from_secs(60));

        let options = EntryOptions::new(Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(options.effective_local_expiration(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn value_of_another_type_is_recomputed() {
        let cache = hybrid(None);
        let _: u32 = cache
            .get_or_compute("k", || async { Ok::<_, String>(1) })
            .await
            .expect("value");

        // A different type for the same key misses locally and recomputes.
        let text: String = cache
            .get_or_compute("k", || async { Ok::<_, String>("one".to_string()) })
            .await
            .expect("value");
        assert_eq!(text, "one");
    }

    #[tokio::test]
    async fn set_writes_through() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = hybrid(Some(remote.clone()));

        cache.set("k", 5_u32, cache.default_options()).await;

        assert!(cache.local_tier().contains("k"));
        assert!(remote.get("k").await.expect("get").is_some());
        assert_eq!(cache.get::<u32>("k").await, Some(5));
    }
}
