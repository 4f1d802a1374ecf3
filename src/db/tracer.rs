//! Query tracing sink.
//!
//! Every statement the core runs (pooled, cached, transactional or metadata
//! introspection) is reported once, after it finishes, to the database's
//! [`QueryTracer`]. Health monitor pings are not traced.

use crate::error::{DbError, DbResult};
use crate::models::{Value, format_args_list};
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A finished statement.
#[derive(Debug, Clone, Copy)]
pub struct QueryEvent<'a> {
    pub started_at: Instant,
    pub elapsed: Duration,
    pub database: &'a str,
    /// Final SQL as sent to the driver
    pub sql: &'a str,
    /// Sanitized arguments
    pub args: &'a [Value],
    pub error: Option<&'a DbError>,
    /// Whether the prepared statement came from the statement cache
    pub from_cache: bool,
    /// Set when the statement ran inside a transaction
    pub transaction_id: Option<&'a str>,
}

/// Receives one event per executed statement.
pub trait QueryTracer: Send + Sync + Debug {
    fn trace(&self, event: &QueryEvent<'_>);
}

/// Default tracer: reports through `tracing`.
///
/// Statements log at `debug`, failures at `warn`, and statements slower than
/// the threshold at `info`.
#[derive(Debug, Clone)]
pub struct LogTracer {
    slow_threshold: Duration,
}

impl LogTracer {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

impl QueryTracer for LogTracer {
    fn trace(&self, event: &QueryEvent<'_>) {
        let elapsed_ms = event.elapsed.as_millis() as u64;
        if let Some(err) = event.error {
            warn!(
                database = %event.database,
                sql = %event.sql,
                args = %format_args_list(event.args),
                elapsed_ms,
                transaction_id = ?event.transaction_id,
                error = %err,
                "Query failed"
            );
        } else if !self.slow_threshold.is_zero() && event.elapsed >= self.slow_threshold {
            info!(
                database = %event.database,
                sql = %event.sql,
                args = %format_args_list(event.args),
                elapsed_ms,
                "Slow query"
            );
        } else {
            debug!(
                database = %event.database,
                sql = %event.sql,
                params = event.args.len(),
                elapsed_ms,
                from_cache = event.from_cache,
                transaction_id = ?event.transaction_id,
                "Query executed"
            );
        }
    }
}

/// Report a finished statement and annotate a failure with its SQL and arguments.
pub(crate) fn traced<T>(
    tracer: &dyn QueryTracer,
    event: QueryEvent<'_>,
    result: DbResult<T>,
) -> DbResult<T> {
    let (sql, args) = (event.sql, event.args);
    tracer.trace(&QueryEvent {
        elapsed: event.started_at.elapsed(),
        error: result.as_ref().err(),
        ..event
    });
    result.map_err(|e| DbError::execution(e, sql, format_args_list(args)))
}
