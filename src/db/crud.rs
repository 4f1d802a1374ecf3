//! Structured write entry points.
//!
//! These synthesize their SQL from table metadata and a sparse [`Record`], then
//! run it through the same pooled path as [`Database::exec`]. The database's
//! [`FeatureFlags`](crate::models::FeatureFlags) add conventional columns:
//!
//! - `timestamps`: `created_at` on insert/upsert, `updated_at` on every write
//! - `optimistic_lock`: `version` seeded on insert, checked and bumped on update
//! - `soft_delete`: deletes stamp `deleted_at` instead of removing the row

use crate::db::database::Database;
use crate::db::metadata::TableMeta;
use crate::dialect::{
    KeyRetrieval, UpsertInput, UpsertPlan, build_delete, build_insert, build_update, build_upsert,
};
use crate::error::{DbError, DbResult};
use crate::models::{Record, Value, WriteOutcome};
use chrono::Utc;
use tracing::debug;

pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const VERSION_COLUMN: &str = "version";
pub const DELETED_AT_COLUMN: &str = "deleted_at";

fn now() -> Value {
    Value::from(Utc::now().naive_utc())
}

fn check_columns(meta: &TableMeta, record: &Record) -> DbResult<()> {
    if record.is_empty() {
        return Err(DbError::invalid_input(format!(
            "no columns to write for table '{}'",
            meta.table
        )));
    }
    match record.columns().iter().find(|c| !meta.has_column(c)) {
        Some(column) => Err(DbError::invalid_input(format!(
            "table '{}' has no column '{column}'",
            meta.table
        ))),
        None => Ok(()),
    }
}

impl Database {
    /// Insert `record` into `table` and report the row's key.
    pub async fn insert(&self, table: &str, record: &Record) -> DbResult<WriteOutcome> {
        let meta = self.table_meta(table).await?;
        let record = self.stamp_new_row(&meta, record, true)?;
        let plan = build_insert(self.dialect(), &upsert_input(&meta, &record))?;
        self.run_keyed_write(plan).await
    }

    /// Insert `record`, or update the row with the same primary key.
    pub async fn save_upsert(&self, table: &str, record: &Record) -> DbResult<WriteOutcome> {
        let meta = self.table_meta(table).await?;
        // A seeded version would reset the counter of an existing row.
        let record = self.stamp_new_row(&meta, record, false)?;
        let plan = build_upsert(self.dialect(), &upsert_input(&meta, &record))?;
        self.run_keyed_write(plan).await
    }

    /// Update the row identified by the primary-key columns of `record`.
    pub async fn update(&self, table: &str, record: &Record) -> DbResult<u64> {
        let meta = self.table_meta(table).await?;
        if meta.primary_keys.is_empty() {
            return Err(DbError::invalid_input(format!(
                "table '{table}' has no primary key; use update_where"
            )));
        }

        let mut set = record.clone();
        let mut clauses = Vec::with_capacity(meta.primary_keys.len());
        let mut args = Vec::with_capacity(meta.primary_keys.len());
        for key in &meta.primary_keys {
            let value = set.remove(key).ok_or_else(|| {
                DbError::invalid_input(format!(
                    "update of '{table}' requires primary key column '{key}'"
                ))
            })?;
            clauses.push(format!("{key} = ?"));
            args.push(value);
        }
        self.update_with_meta(&meta, set, &clauses.join(" AND "), &args)
            .await
    }

    /// Update every row matching `where_clause` with the columns of `record`.
    pub async fn update_where(
        &self,
        table: &str,
        record: &Record,
        where_clause: &str,
        args: &[Value],
    ) -> DbResult<u64> {
        let meta = self.table_meta(table).await?;
        self.update_with_meta(&meta, record.clone(), where_clause, args)
            .await
    }

    /// Delete the rows matching `where_clause`. An empty clause is rejected.
    pub async fn delete(&self, table: &str, where_clause: &str, args: &[Value]) -> DbResult<u64> {
        if where_clause.trim().is_empty() {
            return Err(DbError::invalid_input(format!(
                "delete from '{table}' requires a WHERE clause"
            )));
        }
        let stamp = if self.features().soft_delete {
            let meta = self.table_meta(table).await?;
            meta.has_column(DELETED_AT_COLUMN).then(now)
        } else {
            None
        };
        let soft = stamp.is_some();
        let plan = build_delete(table, where_clause, args, stamp)?;
        let rows = self.exec(&plan.sql, &plan.args).await?.rows_affected;
        debug!(database = %self.name(), table = %table, rows, soft, "Deleted rows");
        Ok(rows)
    }

    /// Apply insert-side feature flags to a copy of `record`.
    fn stamp_new_row(&self, meta: &TableMeta, record: &Record, seed_version: bool) -> DbResult<Record> {
        check_columns(meta, record)?;
        let features = self.features();
        let mut record = record.clone();
        if features.timestamps {
            let stamp = now();
            for column in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
                if meta.has_column(column) && !record.contains(column) {
                    record.insert(column, stamp.clone());
                }
            }
        }
        if seed_version
            && features.optimistic_lock
            && meta.has_column(VERSION_COLUMN)
            && !record.contains(VERSION_COLUMN)
        {
            record.insert(VERSION_COLUMN, 1);
        }
        Ok(record)
    }

    async fn update_with_meta(
        &self,
        meta: &TableMeta,
        mut set: Record,
        where_clause: &str,
        args: &[Value],
    ) -> DbResult<u64> {
        check_columns(meta, &set)?;
        let features = self.features();
        let version = if features.optimistic_lock && meta.has_column(VERSION_COLUMN) {
            set.remove(VERSION_COLUMN)
        } else {
            None
        };
        if features.timestamps
            && meta.has_column(UPDATED_AT_COLUMN)
            && !set.contains(UPDATED_AT_COLUMN)
        {
            set.insert(UPDATED_AT_COLUMN, now());
        }

        let plan = build_update(&meta.table, &set, where_clause, args, version.as_ref())?;
        let rows = self.exec(&plan.sql, &plan.args).await?.rows_affected;
        if version.is_some() && rows == 0 {
            return Err(DbError::version_conflict(&meta.table));
        }
        Ok(rows)
    }

    /// Execute an insert or upsert plan and collect the key it reports.
    async fn run_keyed_write(&self, plan: UpsertPlan) -> DbResult<WriteOutcome> {
        let UpsertPlan { sql, args, key } = plan;
        let outcome = match key {
            KeyRetrieval::Supplied(key) => WriteOutcome {
                rows_affected: self.exec(&sql, &args).await?.rows_affected,
                generated_key: Some(key),
            },
            KeyRetrieval::Returning(column) => {
                let rows = self.query(&sql, &args).await?;
                WriteOutcome {
                    rows_affected: rows.len() as u64,
                    generated_key: rows.first().and_then(|row| row.get(&column)).cloned(),
                }
            }
            KeyRetrieval::LastInsertId => {
                let result = self.exec(&sql, &args).await?;
                WriteOutcome {
                    rows_affected: result.rows_affected,
                    generated_key: result.last_insert_id.map(Value::Int),
                }
            }
            KeyRetrieval::ScopeIdentity => {
                let rows = self.query(&sql, &args).await?;
                WriteOutcome {
                    rows_affected: 1,
                    generated_key: rows
                        .first()
                        .and_then(|row| row.value_at(0))
                        .filter(|value| !value.is_null())
                        .cloned(),
                }
            }
            KeyRetrieval::ReturningInto(column) => {
                let (result, key) = self.exec_returning_into(&sql, &args, &column).await?;
                WriteOutcome {
                    rows_affected: result.rows_affected,
                    generated_key: Some(key),
                }
            }
            KeyRetrieval::RowsAffected => WriteOutcome {
                rows_affected: self.exec(&sql, &args).await?.rows_affected,
                generated_key: None,
            },
        };
        Ok(outcome)
    }
}

fn upsert_input<'a>(meta: &'a TableMeta, record: &'a Record) -> UpsertInput<'a> {
    UpsertInput {
        table: &meta.table,
        primary_keys: &meta.primary_keys,
        identity: meta.identity.as_deref(),
        record,
    }
}
