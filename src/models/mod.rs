//! Data models for the SQL execution core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, FeatureFlags, TransactionState};
pub use query::{CacheStats, DEFAULT_MAX_PAGE_SIZE, ExecResult, Page, WriteOutcome};
pub use value::{Record, TIMESTAMP_FORMAT, Value, format_args_list};
