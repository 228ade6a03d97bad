//! Cache configuration.
//!
//! Built once from the `[cache]` section of `tiercache.toml` (see
//! `crate::config`) and never mutated afterwards.

use std::num::NonZeroU64;
use std::time::Duration;

use super::policy::CachePolicy;

pub(crate) const DEFAULT_OBJECT_CAPACITY: u64 = 50;
pub(crate) const DEFAULT_LOCAL_EXPIRATION_SECS: u64 = 30;
pub(crate) const DEFAULT_REMOTE_EXPIRATION_SECS: u64 = 60;
pub(crate) const DEFAULT_RESPONSE_EXPIRATION_SECS: u64 = 30;
pub(crate) const DEFAULT_RESPONSE_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_RESPONSE_MAX_BODY_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const BUILTIN_POLICIES: &[(&str, &str)] =
    &[("views", "alertstyle"), ("customers", "country")];

/// Validated cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the hybrid cache's local tier, in caller-declared cost units.
    pub object_capacity: NonZeroU64,
    /// Record hit/miss/eviction statistics and metrics.
    pub track_statistics: bool,
    /// Default lifetime of local-tier entries.
    pub local_expiration: Duration,
    /// Default lifetime of remote-tier entries.
    pub remote_expiration: Duration,
    /// Lifetime of cached responses on routes without a policy.
    pub response_default_expiration: Duration,
    /// Response cache capacity; each response costs its body length.
    pub response_capacity_bytes: NonZeroU64,
    /// Responses with larger bodies are served but never stored.
    pub response_max_body_bytes: usize,
    /// Coalesce concurrent misses for the same response key.
    pub allow_locking: bool,
    /// How often the background sweeper drops expired entries.
    pub sweep_interval: Duration,
    /// Named response cache policies.
    pub policies: Vec<CachePolicy>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            object_capacity: NonZeroU64::new(DEFAULT_OBJECT_CAPACITY).unwrap_or(NonZeroU64::MIN),
            track_statistics: true,
            local_expiration: Duration::from_secs(DEFAULT_LOCAL_EXPIRATION_SECS),
            remote_expiration: Duration::from_secs(DEFAULT_REMOTE_EXPIRATION_SECS),
            response_default_expiration: Duration::from_secs(DEFAULT_RESPONSE_EXPIRATION_SECS),
            response_capacity_bytes: NonZeroU64::new(DEFAULT_RESPONSE_CAPACITY_BYTES)
                .unwrap_or(NonZeroU64::MIN),
            response_max_body_bytes: DEFAULT_RESPONSE_MAX_BODY_BYTES,
            allow_locking: true,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            policies: builtin_policies(),
        }
    }
}

impl CacheConfig {
    /// Look up a named policy.
    pub fn policy(&self, name: &str) -> Option<&CachePolicy> {
        self.policies.iter().find(|policy| policy.name() == name)
    }
}

/// Policies available without configuration: `views` varies by `alertstyle`,
/// `customers` by `country`. Both use the default response expiration.
pub(crate) fn builtin_policies() -> Vec<CachePolicy> {
    BUILTIN_POLICIES
        .iter()
        .map(|&(name, vary_by)| {
            CachePolicy::new(
                name,
                [vary_by],
                Duration::from_secs(DEFAULT_RESPONSE_EXPIRATION_SECS),
            )
        })
        .collect()
}
