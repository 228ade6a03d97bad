//! In-process backends used when no database is configured.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    application::repos::{CustomersRepo, RepoError},
    domain::{customers::CustomerId, entities::CustomerRecord},
};

const SAMPLE_CUSTOMERS: &[(&str, &str, &str, &str, &str, &str)] = &[
    ("ALFKI", "Alfreds Futterkiste", "Maria Anders", "Berlin", "Germany", "030-0074321"),
    ("ANATR", "Ana Trujillo Emparedados y helados", "Ana Trujillo", "México D.F.", "Mexico", "(5) 555-4729"),
    ("ANTON", "Antonio Moreno Taquería", "Antonio Moreno", "México D.F.", "Mexico", "(5) 555-3932"),
    ("AROUT", "Around the Horn", "Thomas Hardy", "London", "UK", "(171) 555-7788"),
    ("BERGS", "Berglunds snabbköp", "Christina Berglund", "Luleå", "Sweden", "0921-12 34 65"),
    ("BLAUS", "Blauer See Delikatessen", "Hanna Moos", "Mannheim", "Germany", "0621-08460"),
    ("BONAP", "Bon app'", "Laurence Lebihan", "Marseille", "France", "91.24.45.40"),
];

/// Read-only customer set kept in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCustomers {
    records: BTreeMap<String, CustomerRecord>,
}

impl InMemoryCustomers {
    pub fn new(records: impl IntoIterator<Item = CustomerRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.customer_id.clone(), record))
                .collect(),
        }
    }

    /// The same sample rows the customers migration seeds.
    pub fn sample() -> Self {
        Self::new(SAMPLE_CUSTOMERS.iter().map(
            |&(id, company, contact, city, country, phone)| CustomerRecord {
                customer_id: id.to_string(),
                company_name: company.to_string(),
                contact_name: Some(contact.to_string()),
                city: Some(city.to_string()),
                country: Some(country.to_string()),
                phone: Some(phone.to_string()),
            },
        ))
    }
}

#[async_trait]
impl CustomersRepo for InMemoryCustomers {
    async fn find_customer(&self, id: &CustomerId) -> Result<Option<CustomerRecord>, RepoError> {
        Ok(self.records.get(id.as_str()).cloned())
    }

    async fn list_customers(
        &self,
        country: Option<&str>,
    ) -> Result<Vec<CustomerRecord>, RepoError> {
        Ok(self
            .records
            .values()
            .filter(|record| match (country, record.country.as_deref()) {
                (Some(wanted), Some(actual)) => actual.eq_ignore_ascii_case(wanted),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect())
    }
}
