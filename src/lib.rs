//! sqlweave library
//!
//! A dialect-abstracting SQL execution core. Queries are written once with `?`
//! placeholders and rendered for MySQL, PostgreSQL, SQLite, Oracle or SQL Server;
//! upserts and pagination are synthesized per dialect; prepared statements are
//! cached per database; and a background monitor tracks connection health.

pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{Database, DatabaseRegistry, Driver};
pub use dialect::Dialect;
pub use error::{DbError, DbResult};
