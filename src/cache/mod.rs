//! Tiered cache engine.
//!
//! - **Bounded object cache** ([`BoundedCache`]): cost-accounted LRU store
//!   with optional per-entry expiry.
//! - **Hybrid cache** ([`HybridCache`]): a local [`BoundedCache`] in front of
//!   a shared [`RemoteStore`], with single-flight computation of cold keys.
//! - **Response cache** ([`ResponseCache`] + [`output_cache_layer`]): stores
//!   full HTTP responses keyed by method, path and the query parameters a
//!   [`CachePolicy`] varies by.
//!
//! ## Configuration
//!
//! Controlled via the `[cache]` section of `tiercache.toml`:
//!
//! ```toml
//! [cache]
//! object_capacity = 50
//! local_expiration_seconds = 30
//! remote_expiration_seconds = 60
//! response_default_expiration_seconds = 30
//!
//! [cache.policies.views]
//! vary_by_query = ["alertstyle"]
//! ```

mod config;
mod error;
mod flight;
mod hybrid;
mod keys;
mod lock;
mod middleware;
mod policy;
mod remote;
mod response;
mod store;
mod sweep;

pub use config::CacheConfig;
pub(crate) use config::{
    DEFAULT_LOCAL_EXPIRATION_SECS, DEFAULT_OBJECT_CAPACITY, DEFAULT_REMOTE_EXPIRATION_SECS,
    DEFAULT_RESPONSE_CAPACITY_BYTES, DEFAULT_RESPONSE_EXPIRATION_SECS,
    DEFAULT_RESPONSE_MAX_BODY_BYTES, DEFAULT_SWEEP_INTERVAL_SECS, builtin_policies,
};
pub use error::{CacheError, HybridError, RemoteError};
pub use flight::LocalValue;
pub use hybrid::{EntryOptions, HybridCache, HybridStats};
pub use keys::{derive_key, key_path};
pub use middleware::{OutputCacheState, output_cache_layer};
pub use policy::{CachePolicy, VARY_BY_ALL};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use response::{CachedResponse, NoStore, ResponseCache, ResponseStats};
pub use store::{BoundedCache, CacheEntry, CacheStats};
pub use sweep::spawn_sweeper;
