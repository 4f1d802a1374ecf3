//! Error types for the SQL execution core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! The variants follow the taxonomy callers act on: input validation (never sent to
//! the driver), transient connection failures, version conflicts, dialect limitations
//! and driver errors wrapped with the statement that produced them.

use crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS;
use std::time::Duration;
use thiserror::Error;

/// Operation name of pool-acquire timeouts, which the pool rewrites with its own limit.
pub const POOL_ACQUIRE: &str = "connection pool acquire";

/// Driver error phrases that mean the connection behind a prepared statement is gone.
///
/// Matched case-insensitively as substrings of the rendered error message.
const STALE_CONNECTION_PHRASES: &[&str] = &[
    "bad connection",
    "broken pipe",
    "connection reset",
    "connection refused",
    "server has gone away",
    "lost connection",
    "connection is closed",
    "database is closed",
    "pool closed",
    "invalid connection",
    "unexpected eof",
];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    /// A driver failure annotated with the final SQL and sanitized arguments.
    #[error("{source} [sql: {sql}] [args: {args}]")]
    Execution {
        sql: String,
        args: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {limit_ms}ms")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("Version conflict on table '{table}': the row was modified concurrently")]
    VersionConflict { table: String },

    #[error("Unsupported operation for {dialect}: {operation}")]
    Unsupported { dialect: String, operation: String },

    #[error("Database '{database}' is not initialized")]
    NotInitialized { database: String },

    #[error("Database '{database}' is already registered")]
    AlreadyRegistered { database: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Wrap a driver error with the statement that produced it.
    pub fn execution(source: DbError, sql: impl Into<String>, args: impl Into<String>) -> Self {
        Self::Execution {
            sql: sql.into(),
            args: args.into(),
            source: Box::new(source),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn version_conflict(table: impl Into<String>) -> Self {
        Self::VersionConflict {
            table: table.into(),
        }
    }

    /// Create an unsupported-operation error for a dialect.
    pub fn unsupported(dialect: impl std::fmt::Display, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            dialect: dialect.to_string(),
            operation: operation.into(),
        }
    }

    pub fn not_initialized(database: impl Into<String>) -> Self {
        Self::NotInitialized {
            database: database.into(),
        }
    }

    pub fn already_registered(database: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            database: database.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The innermost error, looking through `Execution` wrappers.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Execution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Timeout { .. } | Self::VersionConflict { .. }
        )
    }

    /// Check if this error is an optimistic-lock conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self.root(), Self::VersionConflict { .. })
    }

    /// Check if this error means the connection behind a statement is unusable.
    ///
    /// Structured connection errors always qualify; other driver errors are matched
    /// against a fixed set of phrases drivers use for dead connections.
    pub fn is_stale_connection(&self) -> bool {
        match self.root() {
            Self::Connection { .. } => true,
            Self::Database { message, .. } | Self::Internal { message } => {
                let lower = message.to_lowercase();
                STALE_CONNECTION_PHRASES
                    .iter()
                    .any(|phrase| lower.contains(phrase))
            }
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::timeout(POOL_ACQUIRE, Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
            },
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reopen the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
            sqlx::Error::WorkerCrashed => {
                DbError::connection("Database worker crashed", "Reopen the database")
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_timeout_keeps_sub_second_limits() {
        let err = DbError::timeout("query execution", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timeout: query execution exceeded 250ms");
        assert!(matches!(err, DbError::Timeout { limit_ms: 250, .. }));
    }

    #[test]
    fn test_pool_timeout_maps_to_acquire_timeout() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err,
            DbError::Timeout { ref operation, limit_ms: 30_000 } if operation == POOL_ACQUIRE
        ));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::version_conflict("users").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_execution_wraps_source() {
        let inner = DbError::database("syntax error near FROM", None, "check syntax");
        let err = DbError::execution(inner, "SELECT * FROM", "[]");
        let rendered = err.to_string();
        assert!(rendered.contains("syntax error near FROM"));
        assert!(rendered.contains("[sql: SELECT * FROM]"));
        assert_eq!(err.suggestion(), Some("check syntax"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_stale_connection_structured() {
        assert!(DbError::connection("I/O error: reset", "retry").is_stale_connection());
    }

    #[test]
    fn test_stale_connection_phrases() {
        let err = DbError::database("driver: Bad Connection", None, "");
        assert!(err.is_stale_connection());

        let wrapped = DbError::execution(
            DbError::internal("MySQL server has gone away"),
            "SELECT 1",
            "[]",
        );
        assert!(wrapped.is_stale_connection());

        let syntax = DbError::database("syntax error", Some("42601".to_string()), "");
        assert!(!syntax.is_stale_connection());
        assert!(!DbError::invalid_input("broken pipe").is_stale_connection());
    }

    #[test]
    fn test_version_conflict_detection() {
        let err = DbError::version_conflict("accounts");
        assert!(err.is_version_conflict());
        assert!(err.to_string().contains("accounts"));
        assert!(!DbError::internal("x").is_version_conflict());
    }
}
