use std::fmt;

use crate::domain::error::DomainError;

const MAX_CUSTOMER_ID_LEN: usize = 5;

/// Normalized customer identifier: up to five ASCII letters or digits,
/// uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let invalid = |reason| DomainError::InvalidCustomerId {
            id: raw.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if trimmed.len() > MAX_CUSTOMER_ID_LEN {
            return Err(invalid("must be at most five characters"));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("must contain only letters and digits"));
        }

        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_trimmed_and_uppercased() {
        let id = CustomerId::parse(" alfki ").expect("valid id");
        assert_eq!(id.as_str(), "ALFKI");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for raw in ["", "TOOLONG", "AL-KI"] {
            assert!(
                matches!(
                    CustomerId::parse(raw),
                    Err(DomainError::InvalidCustomerId { .. })
                ),
                "`{raw}` should be rejected"
            );
        }
    }
}
