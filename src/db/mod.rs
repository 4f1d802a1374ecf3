//! Execution layer.
//!
//! This module provides everything between a rendered statement and the wire:
//! - The driver contract and the built-in sqlx driver
//! - Type mappings and parameter binding for the built-in driver
//! - The per-database statement cache, count cache and metadata cache
//! - `Database`, the execution entry points, and its structured writes
//! - Transactions, query tracing and health monitoring
//! - The database registry

#[macro_use]
pub mod macros;
pub mod count_cache;
pub mod crud;
pub mod database;
pub mod driver;
pub mod metadata;
pub mod monitor;
pub mod params;
pub mod pool;
pub mod registry;
pub mod stmt_cache;
pub mod tracer;
pub mod transaction;
pub mod types;

pub use count_cache::CountCache;
pub use database::Database;
pub use driver::{Driver, DriverTransaction, PoolSettings, PreparedStatement};
pub use metadata::{MetadataCache, TableMeta};
pub use monitor::{HealthMonitor, HealthState, MonitorStatus};
pub use pool::{DbPool, SqlxDriver};
pub use registry::DatabaseRegistry;
pub use stmt_cache::{CachedStatement, StatementCache};
pub use tracer::{LogTracer, QueryEvent, QueryTracer};
pub use transaction::Transaction;
