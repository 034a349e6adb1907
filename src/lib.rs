//! Reverse-proxy cache with exact purge, predicate bans and coordinated
//! invalidation across independent cache nodes.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
