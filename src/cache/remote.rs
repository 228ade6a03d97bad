//! Shared (tier 2) cache backends.
//!
//! The remote tier stores opaque serialized payloads. Every process fronting
//! the same backing source points at the same remote store, so a value
//! computed by one process is reused by the others once their local tier is
//! cold.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::error::RemoteError;

/// Backend for the hybrid cache's shared tier.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a live payload.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError>;

    /// Store a payload that stays live for `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError>;

    /// Delete `key`; deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), RemoteError>;

    /// Drop expired payloads, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, RemoteError> {
        Ok(0)
    }
}

/// In-process stand-in for a distributed cache.
///
/// Used when no shared backend is configured and in tests.
#[derive(Default)]
pub struct MemoryRemoteStore {
    entries: DashMap<String, (Bytes, Instant)>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (entry.0.clone(), entry.1 > now));

        match live {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.entries.remove_if(key, |_, (_, deadline)| *deadline <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RemoteError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RemoteError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, deadline)| *deadline > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn payload_expires_after_ttl() {
        let store = MemoryRemoteStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            store.get("k").await.expect("get"),
            Some(Bytes::from_static(b"v"))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let store = MemoryRemoteStore::new();
        store
            .set("short", Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .expect("set");
        store
            .set("long", Bytes::from_static(b"2"), Duration::from_secs(100))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.purge_expired().await.expect("purge"), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remove_absent_key_is_ok() {
        let store = MemoryRemoteStore::new();
        store.remove("missing").await.expect("idempotent remove");
    }
}
