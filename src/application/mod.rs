//! Application services layer.

pub mod customers;
pub mod error;
pub mod repos;
