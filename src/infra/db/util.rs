use crate::application::repos::RepoError;
use crate::cache::RemoteError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

/// Remote tier failures are never surfaced to cache callers; keep the message.
pub fn remote_error(err: sqlx::Error) -> RemoteError {
    RemoteError::unavailable(err)
}
