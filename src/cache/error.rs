//! Error types shared by the cache tiers.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failures raised by the bounded object cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("entry `{key}` costs {cost} units, exceeding cache capacity of {capacity}")]
    CapacityExceeded {
        key: String,
        cost: u64,
        capacity: u64,
    },
}

/// Failures surfaced by [`HybridCache::get_or_compute`](super::HybridCache::get_or_compute).
///
/// The type is `Clone` because one resolved flight hands the same outcome to
/// every waiter. A failed computation keeps its original error so callers can
/// still tell what kind of failure it was.
#[derive(Debug, Clone, Error)]
pub enum HybridError {
    #[error("computing value for `{key}` failed: {cause}")]
    ComputationFailed {
        key: String,
        cause: Arc<dyn StdError + Send + Sync>,
    },
    #[error("gave up waiting for `{key}` after {waited:?}")]
    Timeout { key: String, waited: Duration },
    #[error("cached value for `{key}` has a different type than requested")]
    TypeMismatch { key: String },
}

impl HybridError {
    pub fn computation_failed(
        key: &str,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::ComputationFailed {
            key: key.to_string(),
            cause: Arc::from(cause.into()),
        }
    }

    /// The error the computation returned, if this is a computation failure.
    pub fn computation_cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::ComputationFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Failures talking to the shared remote tier.
///
/// These never reach callers of the hybrid cache: reads degrade to a miss and
/// writes are skipped.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote cache unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}
