//! The driver contract consumed by the execution core.
//!
//! A [`Driver`] owns the wire connection pool for one logical database. The core
//! never speaks a wire protocol itself: it renders the final SQL and sanitized
//! arguments and hands them to the driver. The built-in implementation lives in
//! [`crate::db::pool`]; Oracle and SQL Server backends are supplied by callers
//! through [`crate::db::DatabaseRegistry::register_driver`].

use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_LIFETIME_SECS, DEFAULT_MIN_CONNECTIONS};
use crate::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Record, Value};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Pool limits a driver was built with.
///
/// The statement cache derives its entry lifetime from `max_lifetime`, so a
/// cached handle never outlives the connections it was prepared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    /// Lifetime of a statement cache entry: half the connection lifetime.
    pub fn statement_ttl(&self) -> Duration {
        self.max_lifetime / 2
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
        }
    }
}

/// A statement validated by the backend and reusable with different arguments.
#[async_trait]
pub trait PreparedStatement: Send + Sync + Debug {
    /// Final SQL text the statement was prepared from.
    fn sql(&self) -> &str;

    async fn query(&self, args: &[Value]) -> DbResult<Vec<Record>>;

    async fn exec(&self, args: &[Value]) -> DbResult<ExecResult>;
}

/// A transaction holding one dedicated connection until commit or rollback.
#[async_trait]
pub trait DriverTransaction: Send {
    async fn query(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Record>>;

    async fn exec(&mut self, sql: &str, args: &[Value]) -> DbResult<ExecResult>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// Connection pool for one backend.
///
/// All SQL handed to a driver is final: markers are already in the dialect's
/// syntax and the argument list matches them one to one.
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    fn dialect(&self) -> Dialect;

    fn settings(&self) -> PoolSettings;

    /// Validate `sql` against the backend and return a reusable handle.
    async fn prepare(&self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>>;

    /// Run an unprepared row-returning statement.
    async fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Record>>;

    /// Run an unprepared statement and report affected rows.
    async fn exec(&self, sql: &str, args: &[Value]) -> DbResult<ExecResult>;

    /// Run a plain `INSERT`, appending `RETURNING <column> INTO` an output bind, and
    /// return the bound value.
    ///
    /// Only backends with output binds (Oracle) implement this.
    async fn exec_returning_into(
        &self,
        _sql: &str,
        _args: &[Value],
        column: &str,
    ) -> DbResult<(ExecResult, Value)> {
        Err(DbError::unsupported(
            self.dialect(),
            format!("RETURNING {} INTO output binds", column),
        ))
    }

    async fn begin(&self) -> DbResult<Box<dyn DriverTransaction>>;

    /// Round-trip to the backend to confirm a connection is usable.
    async fn ping(&self) -> DbResult<()>;

    async fn close(&self);
}
