use async_trait::async_trait;

use crate::{
    application::repos::{CustomersRepo, RepoError},
    domain::{customers::CustomerId, entities::CustomerRecord},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CustomerRow {
    customer_id: String,
    company_name: String,
    contact_name: Option<String>,
    city: Option<String>,
    country: Option<String>,
    phone: Option<String>,
}

impl From<CustomerRow> for CustomerRecord {
    fn from(row: CustomerRow) -> Self {
        Self {
            customer_id: row.customer_id,
            company_name: row.company_name,
            contact_name: row.contact_name,
            city: row.city,
            country: row.country,
            phone: row.phone,
        }
    }
}

#[async_trait]
impl CustomersRepo for PostgresRepositories {
    async fn find_customer(&self, id: &CustomerId) -> Result<Option<CustomerRecord>, RepoError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT customer_id, company_name, contact_name, city, country, phone
            FROM customers
            WHERE customer_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CustomerRecord::from))
    }

    async fn list_customers(
        &self,
        country: Option<&str>,
    ) -> Result<Vec<CustomerRecord>, RepoError> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT customer_id, company_name, contact_name, city, country, phone
            FROM customers
            WHERE $1::text IS NULL OR LOWER(country) = LOWER($1)
            ORDER BY customer_id
            "#,
        )
        .bind(country)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(CustomerRecord::from).collect())
    }
}
