//! Per-table schema metadata used by the structured write entry points.
//!
//! Each database keeps a map of table name to [`TableMeta`]. Readers share a
//! read lock; the first access to a table takes the population mutex,
//! re-checks the map and then runs one introspection query for the dialect.

use crate::dialect::{Dialect, is_valid_identifier};
use crate::error::{DbError, DbResult};
use crate::models::Record;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Columns, primary key and identity column of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub table: String,
    /// Column names in ordinal order
    pub columns: Vec<String>,
    /// Primary key columns in key order
    pub primary_keys: Vec<String>,
    /// Backend-generated column, if any
    pub identity: Option<String>,
}

impl TableMeta {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_keys
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Build from introspection rows carrying `column_name`, `data_type`,
    /// `pk_position` (0 when not part of the key) and `is_identity`.
    pub fn from_rows(table: &str, dialect: Dialect, rows: &[Record]) -> DbResult<Self> {
        if rows.is_empty() {
            return Err(DbError::schema("Table not found", table));
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut keys: Vec<(i64, String)> = Vec::new();
        let mut identity = None;
        for row in rows {
            let name = row
                .get("column_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DbError::schema("Introspection row without column name", table))?
                .to_string();
            let pk_position = row
                .get("pk_position")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            if pk_position > 0 {
                keys.push((pk_position, name.clone()));
            }
            if identity.is_none() && row.get("is_identity").is_some_and(|v| v.as_flag()) {
                identity = Some(name.clone());
            }
            columns.push(name);
        }
        keys.sort_by_key(|(position, _)| *position);
        let primary_keys: Vec<String> = keys.into_iter().map(|(_, name)| name).collect();

        // A lone INTEGER PRIMARY KEY aliases SQLite's rowid.
        if dialect == Dialect::Sqlite && identity.is_none() {
            if let [key] = primary_keys.as_slice() {
                let is_integer = rows.iter().any(|row| {
                    row.get("column_name").and_then(|v| v.as_str()) == Some(key.as_str())
                        && row
                            .get("data_type")
                            .and_then(|v| v.as_str())
                            .is_some_and(|t| t.eq_ignore_ascii_case("INTEGER"))
                });
                if is_integer {
                    identity = Some(key.clone());
                }
            }
        }

        Ok(Self {
            table: table.to_string(),
            columns,
            primary_keys,
            identity,
        })
    }
}

/// Introspection statement for `dialect`, with one `?` for the table name.
pub fn introspection_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "SELECT CAST(c.COLUMN_NAME AS CHAR) AS column_name, CAST(c.DATA_TYPE AS CHAR) AS data_type, \
             COALESCE((SELECT k.ORDINAL_POSITION FROM information_schema.KEY_COLUMN_USAGE k \
             WHERE k.TABLE_SCHEMA = c.TABLE_SCHEMA AND k.TABLE_NAME = c.TABLE_NAME \
             AND k.COLUMN_NAME = c.COLUMN_NAME AND k.CONSTRAINT_NAME = 'PRIMARY'), 0) AS pk_position, \
             CASE WHEN c.EXTRA LIKE '%auto_increment%' THEN 1 ELSE 0 END AS is_identity \
             FROM information_schema.COLUMNS c \
             WHERE c.TABLE_SCHEMA = DATABASE() AND c.TABLE_NAME = ? \
             ORDER BY c.ORDINAL_POSITION"
        }
        Dialect::Postgres => {
            "SELECT c.column_name::text AS column_name, c.data_type::text AS data_type, \
             COALESCE((SELECT k.ordinal_position FROM information_schema.table_constraints t \
             JOIN information_schema.key_column_usage k \
             ON k.constraint_name = t.constraint_name AND k.table_schema = t.table_schema \
             AND k.table_name = t.table_name \
             WHERE t.constraint_type = 'PRIMARY KEY' AND t.table_schema = c.table_schema \
             AND t.table_name = c.table_name AND k.column_name = c.column_name), 0)::bigint AS pk_position, \
             CASE WHEN c.is_identity = 'YES' OR c.column_default LIKE 'nextval(%' THEN 1 ELSE 0 END::bigint AS is_identity \
             FROM information_schema.columns c \
             WHERE c.table_schema = current_schema() AND c.table_name = ? \
             ORDER BY c.ordinal_position"
        }
        Dialect::Sqlite => {
            "SELECT name AS column_name, type AS data_type, pk AS pk_position, 0 AS is_identity \
             FROM pragma_table_info(?) ORDER BY cid"
        }
        Dialect::Oracle => {
            "SELECT c.COLUMN_NAME AS column_name, c.DATA_TYPE AS data_type, \
             NVL((SELECT cc.POSITION FROM USER_CONSTRAINTS k \
             JOIN USER_CONS_COLUMNS cc ON cc.CONSTRAINT_NAME = k.CONSTRAINT_NAME \
             WHERE k.TABLE_NAME = c.TABLE_NAME AND k.CONSTRAINT_TYPE = 'P' \
             AND cc.COLUMN_NAME = c.COLUMN_NAME), 0) AS pk_position, \
             CASE WHEN c.IDENTITY_COLUMN = 'YES' THEN 1 ELSE 0 END AS is_identity \
             FROM USER_TAB_COLUMNS c WHERE c.TABLE_NAME = UPPER(?) ORDER BY c.COLUMN_ID"
        }
        Dialect::SqlServer => {
            "SELECT c.name AS column_name, t.name AS data_type, \
             ISNULL(ic.key_ordinal, 0) AS pk_position, CAST(c.is_identity AS INT) AS is_identity \
             FROM sys.columns c JOIN sys.types t ON t.user_type_id = c.user_type_id \
             LEFT JOIN sys.indexes i ON i.object_id = c.object_id AND i.is_primary_key = 1 \
             LEFT JOIN sys.index_columns ic ON ic.object_id = i.object_id \
             AND ic.index_id = i.index_id AND ic.column_id = c.column_id \
             WHERE c.object_id = OBJECT_ID(?) ORDER BY c.column_id"
        }
    }
}

/// Table metadata for one database.
#[derive(Debug, Default)]
pub struct MetadataCache {
    tables: RwLock<HashMap<String, Arc<TableMeta>>>,
    populate: Mutex<()>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached metadata for `table`, loading it with `load` on first access.
    ///
    /// `load` runs at most once per table, under the population lock.
    pub async fn get_or_load<F, Fut>(&self, table: &str, load: F) -> DbResult<Arc<TableMeta>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<TableMeta>>,
    {
        if !is_valid_identifier(table) {
            return Err(DbError::invalid_input(format!(
                "invalid table name '{table}'"
            )));
        }
        let key = table.to_ascii_lowercase();
        if let Some(meta) = self.tables.read().await.get(&key) {
            return Ok(Arc::clone(meta));
        }

        let _guard = self.populate.lock().await;
        if let Some(meta) = self.tables.read().await.get(&key) {
            return Ok(Arc::clone(meta));
        }

        let meta = Arc::new(load().await?);
        debug!(
            table = %table,
            columns = meta.columns.len(),
            primary_keys = ?meta.primary_keys,
            identity = ?meta.identity,
            "Loaded table metadata"
        );
        self.tables.write().await.insert(key, Arc::clone(&meta));
        Ok(meta)
    }

    pub async fn invalidate(&self, table: &str) -> bool {
        self.tables
            .write()
            .await
            .remove(&table.to_ascii_lowercase())
            .is_some()
    }

    pub async fn clear(&self) {
        self.tables.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(name: &str, data_type: &str, pk: i64, identity: i64) -> Record {
        Record::new()
            .set("column_name", name)
            .set("data_type", data_type)
            .set("pk_position", pk)
            .set("is_identity", identity)
    }

    #[test]
    fn test_from_rows_orders_keys() {
        let rows = vec![
            row("b", "int", 2, 0),
            row("a", "int", 1, 0),
            row("name", "text", 0, 0),
        ];
        let meta = TableMeta::from_rows("t", Dialect::Postgres, &rows).unwrap();
        assert_eq!(meta.primary_keys, vec!["a", "b"]);
        assert_eq!(meta.identity, None);
        assert!(meta.has_column("NAME"));
    }

    #[test]
    fn test_sqlite_rowid_alias_is_identity() {
        let rows = vec![row("id", "INTEGER", 1, 0), row("name", "TEXT", 0, 0)];
        let meta = TableMeta::from_rows("t", Dialect::Sqlite, &rows).unwrap();
        assert_eq!(meta.identity.as_deref(), Some("id"));

        let rows = vec![row("code", "TEXT", 1, 0)];
        let meta = TableMeta::from_rows("t", Dialect::Sqlite, &rows).unwrap();
        assert_eq!(meta.identity, None);
    }

    #[test]
    fn test_unknown_table_is_schema_error() {
        let err = TableMeta::from_rows("missing", Dialect::MySql, &[]).unwrap_err();
        assert!(matches!(err, DbError::Schema { .. }));
    }

    #[test]
    fn test_text_flags_are_read() {
        let rows = vec![
            Record::new()
                .set("column_name", "ID")
                .set("data_type", "NUMBER")
                .set("pk_position", Value::Text("1".into()))
                .set("is_identity", Value::Text("1".into())),
        ];
        let meta = TableMeta::from_rows("T", Dialect::Oracle, &rows).unwrap();
        assert_eq!(meta.primary_keys, vec!["ID"]);
        assert_eq!(meta.identity.as_deref(), Some("ID"));
    }

    #[tokio::test]
    async fn test_loads_once() {
        let cache = MetadataCache::new();
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        for _ in 0..3 {
            let meta = cache
                .get_or_load("Users", move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    TableMeta::from_rows("users", Dialect::MySql, &[row("id", "int", 1, 1)])
                })
                .await
                .unwrap();
            assert_eq!(meta.identity.as_deref(), Some("id"));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cache.invalidate("users").await);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_table_name() {
        let cache = MetadataCache::new();
        let err = cache
            .get_or_load("users; DROP TABLE x", || async {
                Err(DbError::internal("unreachable"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }
}
