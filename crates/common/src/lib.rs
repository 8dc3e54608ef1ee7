//! Common types and configuration shared across Weir crates.
//!
//! - **Model**: rowsets, schemas, predicates, source/table descriptors (`model`).
//! - **Principal**: the immutable per-query caller identity (`principal`).
//! - **Configuration**: strongly typed application configuration (`config`).
//! - **Resilience**: retry with exponential backoff for transient source errors (`retry`).
//! - **Telemetry**: observability setup (`telemetry`).
pub mod config;
pub mod model;
pub mod principal;
pub mod retry;
pub mod telemetry;
