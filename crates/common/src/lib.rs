//! Shared building blocks for the ReleaseBeacon workspace: domain types,
//! errors, configuration and connection helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod telemetry;
pub mod types;
