//! Storage layer: DuckDB tables for awards, vendors, monthly aggregates, anomalies, and models.

mod error;
pub use error::StoreError;

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::{DuckStore, StoredModel};
