//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::customers::CustomerId;
use crate::domain::entities::CustomerRecord;

#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Read access to customers; the data source behind the hybrid cache.
#[async_trait]
pub trait CustomersRepo: Send + Sync {
    async fn find_customer(&self, id: &CustomerId) -> Result<Option<CustomerRecord>, RepoError>;

    /// Customers ordered by id, optionally restricted to one country
    /// (case-insensitive).
    async fn list_customers(&self, country: Option<&str>)
    -> Result<Vec<CustomerRecord>, RepoError>;
}
