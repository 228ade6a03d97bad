use std::sync::Arc;

use tracing::instrument;

use crate::application::error::AppError;
use crate::application::repos::CustomersRepo;
use crate::cache::HybridCache;
use crate::domain::customers::CustomerId;
use crate::domain::entities::CustomerRecord;

/// Customer lookups served through the hybrid cache.
#[derive(Clone)]
pub struct CustomerService {
    customers: Arc<dyn CustomersRepo>,
    cache: HybridCache,
}

impl CustomerService {
    pub fn new(customers: Arc<dyn CustomersRepo>, cache: HybridCache) -> Self {
        Self { customers, cache }
    }

    pub fn cache(&self) -> &HybridCache {
        &self.cache
    }

    /// Look up one customer. Unknown ids are cached too, as `None`.
    #[instrument(skip(self), fields(customer = %id))]
    pub async fn customer(&self, id: &CustomerId) -> Result<Option<CustomerRecord>, AppError> {
        let customers = Arc::clone(&self.customers);
        let owned = id.clone();
        let record = self
            .cache
            .get_or_compute(&customer_key(id), move || async move {
                customers.find_customer(&owned).await
            })
            .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn customers(&self, country: Option<&str>) -> Result<Vec<CustomerRecord>, AppError> {
        let country = country
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let key = list_key(country.as_deref());

        let customers = Arc::clone(&self.customers);
        let records = self
            .cache
            .get_or_compute(&key, move || async move {
                customers.list_customers(country.as_deref()).await
            })
            .await?;
        Ok(records)
    }

    /// Drop the cached entry for `id` from both tiers.
    pub async fn invalidate_customer(&self, id: &CustomerId) {
        self.cache.invalidate(&customer_key(id)).await;
    }
}

pub fn customer_key(id: &CustomerId) -> String {
    format!("customer:{id}")
}

fn list_key(country: Option<&str>) -> String {
    match country {
        Some(country) => format!("customers:list:{}", country.to_lowercase()),
        None => "customers:list:all".to_string(),
    }
}
