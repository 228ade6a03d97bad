//! Domain layer types and invariants.

pub mod customers;
pub mod entities;
pub mod error;
