//! SQL dialect handling.
//!
//! This module holds everything that depends only on the target backend's syntax:
//! - The static dialect descriptor table
//! - A quote/comment/parenthesis aware structural scanner
//! - Placeholder translation and argument sanitizing
//! - Upsert/merge, insert, update and delete synthesis
//! - COUNT and windowed query generation for pagination
//!
//! Nothing in here talks to a database; the `db` module feeds the generated SQL
//! to a driver.

pub mod pagination;
pub mod placeholder;
pub mod scanner;
pub mod upsert;

pub use pagination::{
    PageWindow, ROWNUM_COLUMN, build_window_sql, optimize_count_sql, wrap_count_sql,
};
pub use placeholder::{
    Sanitized, count_markers, prepare_statement, sanitize_args, translate, translate_from,
};
pub use scanner::{
    contains_top_level_keyword, find_top_level_keyword, is_simple_select, limits_rows,
    mask_literals, split_order_by, strip_terminator,
};
pub use upsert::{
    KeyRetrieval, UpsertInput, UpsertPlan, WritePlan, build_delete, build_insert, build_update,
    build_upsert,
};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Includes MariaDB
    MySql,
    Postgres,
    Sqlite,
    Oracle,
    SqlServer,
}

/// Positional marker syntax understood by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `:1`, `:2`, ...
    Colon,
    /// `@p1`, `@p2`, ...
    AtP,
}

impl PlaceholderStyle {
    /// Render the marker for the 1-based argument position `index`.
    pub fn marker(self, index: usize) -> String {
        match self {
            Self::Question => "?".to_string(),
            Self::Dollar => format!("${index}"),
            Self::Colon => format!(":{index}"),
            Self::AtP => format!("@p{index}"),
        }
    }

    /// Whether markers carry their own position.
    pub fn is_numbered(self) -> bool {
        !matches!(self, Self::Question)
    }
}

/// How a backend expresses insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStyle {
    OnDuplicateKey,
    OnConflict,
    Merge,
}

/// How a backend expresses a row window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    LimitOffset,
    OffsetFetch,
    RowNum,
}

/// Static facts about one backend.
#[derive(Debug)]
pub struct DialectDescriptor {
    pub name: &'static str,
    pub placeholder: PlaceholderStyle,
    pub upsert: UpsertStyle,
    pub pagination: PaginationStyle,
    /// `AS` before a derived-table alias (Oracle rejects it).
    pub subquery_alias_as: bool,
    /// Statement terminator the dialect requires on synthesized statements.
    pub terminator: Option<&'static str>,
    /// Source table in a row constructor select (`FROM DUAL`).
    pub dual_table: Option<&'static str>,
    /// Identity columns may be assigned in an upsert's update clause.
    pub identity_updatable: bool,
    pub supports_returning: bool,
    pub supports_last_insert_id: bool,
    pub ping_sql: &'static str,
    pub default_port: Option<u16>,
}

static MYSQL: DialectDescriptor = DialectDescriptor {
    name: "MySQL",
    placeholder: PlaceholderStyle::Question,
    upsert: UpsertStyle::OnDuplicateKey,
    pagination: PaginationStyle::LimitOffset,
    subquery_alias_as: true,
    terminator: None,
    dual_table: None,
    identity_updatable: true,
    supports_returning: false,
    supports_last_insert_id: true,
    ping_sql: "SELECT 1",
    default_port: Some(3306),
};

static POSTGRES: DialectDescriptor = DialectDescriptor {
    name: "PostgreSQL",
    placeholder: PlaceholderStyle::Dollar,
    upsert: UpsertStyle::OnConflict,
    pagination: PaginationStyle::LimitOffset,
    subquery_alias_as: true,
    terminator: None,
    dual_table: None,
    identity_updatable: true,
    supports_returning: true,
    supports_last_insert_id: false,
    ping_sql: "SELECT 1",
    default_port: Some(5432),
};

static SQLITE: DialectDescriptor = DialectDescriptor {
    name: "SQLite",
    placeholder: PlaceholderStyle::Question,
    upsert: UpsertStyle::OnConflict,
    pagination: PaginationStyle::LimitOffset,
    subquery_alias_as: true,
    terminator: None,
    dual_table: None,
    identity_updatable: true,
    supports_returning: false,
    supports_last_insert_id: true,
    ping_sql: "SELECT 1",
    default_port: None,
};

static ORACLE: DialectDescriptor = DialectDescriptor {
    name: "Oracle",
    placeholder: PlaceholderStyle::Colon,
    upsert: UpsertStyle::Merge,
    pagination: PaginationStyle::RowNum,
    subquery_alias_as: false,
    terminator: None,
    dual_table: Some("DUAL"),
    identity_updatable: false,
    supports_returning: false,
    supports_last_insert_id: false,
    ping_sql: "SELECT 1 FROM DUAL",
    default_port: Some(1521),
};

static SQLSERVER: DialectDescriptor = DialectDescriptor {
    name: "SQL Server",
    placeholder: PlaceholderStyle::AtP,
    upsert: UpsertStyle::Merge,
    pagination: PaginationStyle::OffsetFetch,
    subquery_alias_as: true,
    terminator: Some(";"),
    dual_table: None,
    identity_updatable: false,
    supports_returning: false,
    supports_last_insert_id: false,
    ping_sql: "SELECT 1",
    default_port: Some(1433),
};

impl Dialect {
    /// Every supported dialect, in descriptor-table order.
    pub const ALL: [Dialect; 5] = [
        Dialect::MySql,
        Dialect::Postgres,
        Dialect::Sqlite,
        Dialect::Oracle,
        Dialect::SqlServer,
    ];

    /// Static facts for this dialect.
    pub fn descriptor(self) -> &'static DialectDescriptor {
        match self {
            Self::MySql => &MYSQL,
            Self::Postgres => &POSTGRES,
            Self::Sqlite => &SQLITE,
            Self::Oracle => &ORACLE,
            Self::SqlServer => &SQLSERVER,
        }
    }

    /// Parse the dialect from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySql)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if lower.starts_with("oracle://") {
            Some(Self::Oracle)
        } else if lower.starts_with("sqlserver://") || lower.starts_with("mssql://") {
            Some(Self::SqlServer)
        } else {
            None
        }
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        self.descriptor().name
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        self.descriptor().default_port
    }

    pub fn placeholder(&self) -> PlaceholderStyle {
        self.descriptor().placeholder
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "oracle" => Ok(Self::Oracle),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            other => Err(format!("Unknown SQL dialect: {other}")),
        }
    }
}

/// Check that `name` is a plain (optionally schema-qualified) SQL identifier.
///
/// Structured entry points splice table and column names into SQL text, so
/// anything outside `[A-Za-z_][A-Za-z0-9_$]*` (dot-separated) is rejected.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                }
                _ => false,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_connection_string() {
        assert_eq!(
            Dialect::from_connection_string("postgres://localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_connection_string("postgresql://localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_connection_string("mysql://localhost/db"),
            Some(Dialect::MySql)
        );
        assert_eq!(
            Dialect::from_connection_string("sqlite:test.db"),
            Some(Dialect::Sqlite)
        );
        assert_eq!(
            Dialect::from_connection_string("mssql://sa@localhost/db"),
            Some(Dialect::SqlServer)
        );
        assert_eq!(
            Dialect::from_connection_string("oracle://scott@localhost/orcl"),
            Some(Dialect::Oracle)
        );
        assert_eq!(Dialect::from_connection_string("unknown://localhost"), None);
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("PostgreSQL".parse::<Dialect>(), Ok(Dialect::Postgres));
        assert_eq!("mssql".parse::<Dialect>(), Ok(Dialect::SqlServer));
        assert!("db2".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_descriptor_table() {
        assert_eq!(Dialect::MySql.descriptor().upsert, UpsertStyle::OnDuplicateKey);
        assert_eq!(Dialect::Sqlite.descriptor().upsert, UpsertStyle::OnConflict);
        assert_eq!(Dialect::Oracle.descriptor().pagination, PaginationStyle::RowNum);
        assert_eq!(
            Dialect::SqlServer.descriptor().pagination,
            PaginationStyle::OffsetFetch
        );
        assert!(!Dialect::Oracle.descriptor().subquery_alias_as);
        assert_eq!(Dialect::SqlServer.descriptor().terminator, Some(";"));
    }

    #[test]
    fn test_placeholder_markers() {
        assert_eq!(PlaceholderStyle::Question.marker(3), "?");
        assert_eq!(PlaceholderStyle::Dollar.marker(3), "$3");
        assert_eq!(PlaceholderStyle::Colon.marker(3), ":3");
        assert_eq!(PlaceholderStyle::AtP.marker(3), "@p3");
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("app.users"));
        assert!(is_valid_identifier("_tmp$1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1users"));
        assert!(!is_valid_identifier("users; DROP TABLE x"));
        assert!(!is_valid_identifier("app..users"));
    }
}
