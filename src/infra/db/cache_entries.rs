//! Postgres as the hybrid cache's shared tier.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

use crate::cache::{RemoteError, RemoteStore};

use super::{PostgresRepositories, remote_error};

#[async_trait]
impl RemoteStore for PostgresRepositories {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        let value: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT value
            FROM cache_entries
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(remote_error)?;

        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError> {
        let ttl = time::Duration::try_from(ttl).map_err(RemoteError::unavailable)?;
        let expires_at = OffsetDateTime::now_utc() + ttl;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value.as_ref())
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(remote_error)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RemoteError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(remote_error)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RemoteError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= now()")
            .execute(self.pool())
            .await
            .map_err(remote_error)?;
        Ok(result.rows_affected())
    }
}
