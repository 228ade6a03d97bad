//! Named response cache policies.

use std::collections::BTreeSet;
use std::time::Duration;

/// Vary-by entry meaning "every query parameter".
pub const VARY_BY_ALL: &str = "*";

/// Per-route response caching rules.
///
/// Query key names are stored lowercased so that matching against request
/// parameters is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    name: String,
    vary_by_query_keys: BTreeSet<String>,
    expiration: Duration,
}

impl CachePolicy {
    pub fn new<I, S>(name: impl Into<String>, vary_by_query_keys: I, expiration: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            vary_by_query_keys: vary_by_query_keys
                .into_iter()
                .map(|key| key.as_ref().trim().to_ascii_lowercase())
                .filter(|key| !key.is_empty())
                .collect(),
            expiration,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub fn vary_by_query_keys(&self) -> &BTreeSet<String> {
        &self.vary_by_query_keys
    }

    pub fn varies_by_all(&self) -> bool {
        self.vary_by_query_keys.contains(VARY_BY_ALL)
    }

    /// Whether the query parameter `name` participates in key derivation.
    pub fn varies_by(&self, name: &str) -> bool {
        self.varies_by_all()
            || self
                .vary_by_query_keys
                .contains(name.to_ascii_lowercase().as_str())
    }
}
