//! Tiered caching for an axum service: a bounded in-process object cache, a
//! hybrid local/remote cache with single-flight computation, and an HTTP
//! response cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
