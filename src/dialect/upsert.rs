//! Write statement synthesis.
//!
//! Builds dialect-correct insert-or-update statements, plus the plain `INSERT`,
//! `UPDATE` and `DELETE` statements used by the structured write entry points.
//! Generated SQL always uses the generic `?` marker; it is rendered for the target
//! dialect by [`prepare_statement`](super::prepare_statement) like any other query.
//!
//! Table and column names are spliced into the SQL text, so they are validated with
//! [`is_valid_identifier`] and never quoted.

use super::{Dialect, DialectDescriptor, UpsertStyle, is_valid_identifier};
use crate::error::{DbError, DbResult};
use crate::models::{Record, Value};

/// How the key of a written row is obtained after execution.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRetrieval {
    /// The caller supplied the key; nothing is generated.
    Supplied(Value),
    /// The statement ends in `RETURNING column` and must be run as a query.
    Returning(String),
    /// Read the driver's last-insert-id after exec.
    LastInsertId,
    /// The statement ends in `SELECT SCOPE_IDENTITY()` and must be run as a query.
    ScopeIdentity,
    /// Run through [`Driver::exec_returning_into`](crate::db::Driver::exec_returning_into),
    /// which binds an output parameter for the column.
    ReturningInto(String),
    /// No key is available; only the affected row count is reported.
    RowsAffected,
}

/// Input for [`build_upsert`] and [`build_insert`].
#[derive(Debug, Clone, Copy)]
pub struct UpsertInput<'a> {
    pub table: &'a str,
    pub primary_keys: &'a [String],
    pub identity: Option<&'a str>,
    pub record: &'a Record,
}

/// A synthesized write statement with its arguments and key retrieval plan.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    pub sql: String,
    pub args: Vec<Value>,
    pub key: KeyRetrieval,
}

/// A synthesized statement that needs no key retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Column sets shared by the upsert builders.
struct Columns<'a> {
    table: &'a str,
    keys: Vec<&'a str>,
    identity: Option<&'a str>,
    /// Columns inserted, with their values
    insert: Vec<(&'a str, &'a Value)>,
    /// Columns assigned when the row already exists
    update: Vec<&'a str>,
    /// Row constructor for MERGE: every record column plus missing key columns as NULL
    source: Vec<(&'a str, Option<&'a Value>)>,
}

impl<'a> Columns<'a> {
    fn is_key(&self, column: &str) -> bool {
        self.keys.iter().any(|k| k.eq_ignore_ascii_case(column))
    }

    fn is_identity(&self, column: &str) -> bool {
        self.identity
            .is_some_and(|identity| identity.eq_ignore_ascii_case(column))
    }

    fn identity_is_key(&self) -> bool {
        self.identity.is_some_and(|identity| self.is_key(identity))
    }
}

fn check_identifier(kind: &str, name: &str) -> DbResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!("invalid {kind} name: '{name}'")))
    }
}

fn check_record(table: &str, record: &Record) -> DbResult<()> {
    check_identifier("table", table)?;
    if record.is_empty() {
        return Err(DbError::invalid_input(format!(
            "no columns to write for table '{table}'"
        )));
    }
    for column in record.columns() {
        check_identifier("column", column)?;
    }
    Ok(())
}

fn resolve_columns<'a>(desc: &DialectDescriptor, input: &UpsertInput<'a>) -> DbResult<Columns<'a>> {
    check_record(input.table, input.record)?;
    for key in input.primary_keys {
        check_identifier("key column", key)?;
    }
    if let Some(identity) = input.identity {
        check_identifier("identity column", identity)?;
    }

    let mut cols = Columns {
        table: input.table,
        keys: input.primary_keys.iter().map(String::as_str).collect(),
        identity: input.identity,
        insert: Vec::new(),
        update: Vec::new(),
        source: Vec::new(),
    };

    let merge = desc.upsert == UpsertStyle::Merge;
    for (column, value) in input.record.iter() {
        let identity = cols.is_identity(column);
        cols.source.push((column, Some(value)));
        if identity && (merge || value.is_unset_identity()) {
            continue;
        }
        cols.insert.push((column, value));
        if !cols.is_key(column) && (desc.identity_updatable || !identity) {
            cols.update.push(column);
        }
    }
    for &key in &cols.keys {
        if !input.record.contains(key) {
            cols.source.push((key, None));
        }
    }
    Ok(cols)
}

/// One upsert builder per dialect family.
trait UpsertBuilder {
    fn build(&self, dialect: Dialect, cols: &Columns<'_>) -> (String, Vec<Value>);
}

struct OnDuplicateKey;
struct OnConflict;
struct Merge;

fn builder(style: UpsertStyle) -> &'static dyn UpsertBuilder {
    match style {
        UpsertStyle::OnDuplicateKey => &OnDuplicateKey,
        UpsertStyle::OnConflict => &OnConflict,
        UpsertStyle::Merge => &Merge,
    }
}

fn insert_clause(cols: &Columns<'_>) -> (String, Vec<Value>) {
    let names: Vec<&str> = cols.insert.iter().map(|(c, _)| *c).collect();
    let markers = vec!["?"; names.len()].join(", ");
    let args = cols.insert.iter().map(|(_, v)| (*v).clone()).collect();
    (
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            cols.table,
            names.join(", "),
            markers
        ),
        args,
    )
}

impl UpsertBuilder for OnDuplicateKey {
    fn build(&self, _dialect: Dialect, cols: &Columns<'_>) -> (String, Vec<Value>) {
        let (insert, args) = insert_clause(cols);
        let mut assignments = Vec::with_capacity(cols.update.len() + 1);
        // Reports the existing row's id through LAST_INSERT_ID() when the update branch runs.
        if let (true, Some(identity)) = (cols.identity_is_key(), cols.identity) {
            assignments.push(format!("{identity} = LAST_INSERT_ID({identity})"));
        }
        assignments.extend(cols.update.iter().map(|c| format!("{c} = VALUES({c})")));
        if assignments.is_empty() {
            let key = cols.keys[0];
            assignments.push(format!("{key} = {key}"));
        }
        (
            format!("{insert} ON DUPLICATE KEY UPDATE {}", assignments.join(", ")),
            args,
        )
    }
}

impl UpsertBuilder for OnConflict {
    fn build(&self, _dialect: Dialect, cols: &Columns<'_>) -> (String, Vec<Value>) {
        let (insert, args) = insert_clause(cols);
        let mut assignments: Vec<String> = cols
            .update
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        if assignments.is_empty() {
            let key = cols.keys[0];
            assignments.push(format!("{key} = EXCLUDED.{key}"));
        }
        (
            format!(
                "{insert} ON CONFLICT ({}) DO UPDATE SET {}",
                cols.keys.join(", "),
                assignments.join(", ")
            ),
            args,
        )
    }
}

impl UpsertBuilder for Merge {
    fn build(&self, dialect: Dialect, cols: &Columns<'_>) -> (String, Vec<Value>) {
        let desc = dialect.descriptor();
        let mut args = Vec::with_capacity(cols.source.len());
        let projection: Vec<String> = cols
            .source
            .iter()
            .map(|(column, value)| match value {
                Some(value) => {
                    args.push((*value).clone());
                    format!("? AS {column}")
                }
                None => format!("NULL AS {column}"),
            })
            .collect();

        let mut sql = format!("MERGE INTO {} t USING (SELECT {}", cols.table, projection.join(", "));
        if let Some(dual) = desc.dual_table {
            sql.push_str(&format!(" FROM {dual}"));
        }
        sql.push_str(if desc.subquery_alias_as { ") AS s" } else { ") s" });

        let on: Vec<String> = cols.keys.iter().map(|k| format!("t.{k} = s.{k}")).collect();
        sql.push_str(&format!(" ON ({})", on.join(" AND ")));

        if !cols.update.is_empty() {
            let set: Vec<String> = cols.update.iter().map(|c| format!("t.{c} = s.{c}")).collect();
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set.join(", ")));
        } else if dialect != Dialect::Oracle && !cols.identity_is_key() {
            // Oracle rejects assigning columns referenced in ON; SQL Server rejects identity assignment.
            let key = cols.keys[0];
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET t.{key} = s.{key}"));
        }

        let names: Vec<&str> = cols.insert.iter().map(|(c, _)| *c).collect();
        let values: Vec<String> = names.iter().map(|c| format!("s.{c}")).collect();
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            names.join(", "),
            values.join(", ")
        ));
        if let Some(terminator) = desc.terminator {
            sql.push_str(terminator);
        }
        (sql, args)
    }
}

/// Pick how the written row's key is reported.
fn plan_key(dialect: Dialect, input: &UpsertInput<'_>, upsert: bool) -> KeyRetrieval {
    let desc = dialect.descriptor();
    let single_key = match input.primary_keys {
        [key] => Some(key.as_str()),
        _ => None,
    };
    let Some(key_column) = input.identity.or(single_key) else {
        return KeyRetrieval::RowsAffected;
    };
    if let Some(value) = input.record.get(key_column) {
        if !value.is_unset_identity() {
            return KeyRetrieval::Supplied(value.clone().resolve());
        }
    }
    let Some(identity) = input.identity else {
        return KeyRetrieval::RowsAffected;
    };

    if desc.supports_returning && (!upsert || single_key.is_some()) {
        KeyRetrieval::Returning(identity.to_string())
    } else if desc.supports_last_insert_id {
        KeyRetrieval::LastInsertId
    } else if dialect == Dialect::SqlServer {
        KeyRetrieval::ScopeIdentity
    } else if dialect == Dialect::Oracle && !upsert {
        // MERGE has no RETURNING clause in Oracle.
        KeyRetrieval::ReturningInto(identity.to_string())
    } else {
        KeyRetrieval::RowsAffected
    }
}

fn append_retrieval(sql: &mut String, key: &KeyRetrieval, identity: Option<&str>) {
    match key {
        KeyRetrieval::Returning(column) => sql.push_str(&format!(" RETURNING {column}")),
        KeyRetrieval::ScopeIdentity => {
            let alias = identity.unwrap_or("id");
            if !sql.ends_with(';') {
                sql.push(';');
            }
            sql.push_str(&format!(" SELECT CAST(SCOPE_IDENTITY() AS BIGINT) AS {alias}"));
        }
        _ => {}
    }
}

/// Build an insert-or-update statement for `dialect`.
///
/// Every primary-key column must be present in the record unless it is the identity
/// column. Identity columns holding zero or NULL are left for the backend to generate.
pub fn build_upsert(dialect: Dialect, input: &UpsertInput<'_>) -> DbResult<UpsertPlan> {
    let desc = dialect.descriptor();
    if input.primary_keys.is_empty() {
        return Err(DbError::invalid_input(format!(
            "table '{}' has no primary key; upsert needs a conflict target",
            input.table
        )));
    }
    for key in input.primary_keys {
        let is_identity = input
            .identity
            .is_some_and(|identity| identity.eq_ignore_ascii_case(key));
        if !is_identity && !input.record.contains(key) {
            return Err(DbError::invalid_input(format!(
                "upsert into '{}' requires primary key column '{key}'",
                input.table
            )));
        }
    }

    let cols = resolve_columns(desc, input)?;
    if cols.insert.is_empty() {
        return Err(DbError::invalid_input(format!(
            "no insertable columns for table '{}'",
            input.table
        )));
    }
    let (mut sql, args) = builder(desc.upsert).build(dialect, &cols);
    let key = plan_key(dialect, input, true);
    append_retrieval(&mut sql, &key, input.identity);
    Ok(UpsertPlan { sql, args, key })
}

/// Build a plain `INSERT` with the same key retrieval rules as [`build_upsert`].
pub fn build_insert(dialect: Dialect, input: &UpsertInput<'_>) -> DbResult<UpsertPlan> {
    check_record(input.table, input.record)?;
    let mut names = Vec::with_capacity(input.record.len());
    let mut args = Vec::with_capacity(input.record.len());
    for (column, value) in input.record.iter() {
        let identity = input
            .identity
            .is_some_and(|identity| identity.eq_ignore_ascii_case(column));
        if identity && value.is_unset_identity() {
            continue;
        }
        names.push(column);
        args.push(value.clone());
    }
    if names.is_empty() {
        return Err(DbError::invalid_input(format!(
            "no insertable columns for table '{}'",
            input.table
        )));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        input.table,
        names.join(", "),
        vec!["?"; names.len()].join(", ")
    );
    let key = plan_key(dialect, input, false);
    append_retrieval(&mut sql, &key, input.identity);
    Ok(UpsertPlan { sql, args, key })
}

/// Build `UPDATE table SET ... WHERE where_clause`.
///
/// With `version`, the statement also bumps the `version` column and only matches
/// rows still carrying the given version.
pub fn build_update(
    table: &str,
    set: &Record,
    where_clause: &str,
    where_args: &[Value],
    version: Option<&Value>,
) -> DbResult<WritePlan> {
    check_record(table, set)?;
    let where_clause = where_clause.trim();
    if where_clause.is_empty() {
        return Err(DbError::invalid_input(format!(
            "update of '{table}' requires a WHERE clause"
        )));
    }

    let mut assignments: Vec<String> = set.columns().iter().map(|c| format!("{c} = ?")).collect();
    let mut args: Vec<Value> = set.values().to_vec();
    if version.is_some() {
        assignments.push("version = version + 1".to_string());
    }
    let mut sql = format!(
        "UPDATE {table} SET {} WHERE ({where_clause})",
        assignments.join(", ")
    );
    args.extend_from_slice(where_args);
    if let Some(version) = version {
        sql.push_str(" AND version = ?");
        args.push(version.clone());
    }
    Ok(WritePlan { sql, args })
}

/// Build `DELETE FROM table WHERE where_clause`.
///
/// With `soft_delete`, the row is instead stamped: `UPDATE table SET deleted_at = ?`.
pub fn build_delete(
    table: &str,
    where_clause: &str,
    where_args: &[Value],
    soft_delete: Option<Value>,
) -> DbResult<WritePlan> {
    check_identifier("table", table)?;
    let where_clause = where_clause.trim();
    if where_clause.is_empty() {
        return Err(DbError::invalid_input(format!(
            "delete from '{table}' requires a WHERE clause"
        )));
    }

    Ok(match soft_delete {
        Some(stamp) => {
            let mut args = Vec::with_capacity(where_args.len() + 1);
            args.push(stamp);
            args.extend_from_slice(where_args);
            WritePlan {
                sql: format!("UPDATE {table} SET deleted_at = ? WHERE {where_clause}"),
                args,
            }
        }
        None => WritePlan {
            sql: format!("DELETE FROM {table} WHERE {where_clause}"),
            args: where_args.to_vec(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mysql_upsert() {
        let pk = keys(&["id"]);
        let record = Record::new().set("id", 0).set("name", "a").set("age", 3);
        let plan = build_upsert(
            Dialect::MySql,
            &UpsertInput {
                table: "users",
                primary_keys: &pk,
                identity: Some("id"),
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "INSERT INTO users (name, age) VALUES (?, ?) ON DUPLICATE KEY UPDATE \
             id = LAST_INSERT_ID(id), name = VALUES(name), age = VALUES(age)"
        );
        assert_eq!(plan.args, vec![Value::from("a"), Value::Int(3)]);
        assert_eq!(plan.key, KeyRetrieval::LastInsertId);
    }

    #[test]
    fn test_mysql_upsert_natural_key_only() {
        let pk = keys(&["code"]);
        let record = Record::new().set("code", "x");
        let plan = build_upsert(
            Dialect::MySql,
            &UpsertInput {
                table: "tags",
                primary_keys: &pk,
                identity: None,
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "INSERT INTO tags (code) VALUES (?) ON DUPLICATE KEY UPDATE code = code"
        );
        assert_eq!(plan.key, KeyRetrieval::Supplied(Value::from("x")));
    }

    #[test]
    fn test_postgres_upsert_returns_key() {
        let pk = keys(&["id"]);
        let record = Record::new().set("name", "a");
        let plan = build_upsert(
            Dialect::Postgres,
            &UpsertInput {
                table: "users",
                primary_keys: &pk,
                identity: Some("id"),
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "INSERT INTO users (name) VALUES (?) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name RETURNING id"
        );
        assert_eq!(plan.key, KeyRetrieval::Returning("id".to_string()));
    }

    #[test]
    fn test_sqlite_upsert_with_key_and_one_field() {
        let pk = keys(&["id"]);
        let record = Record::new().set("id", 7).set("name", "b");
        let plan = build_upsert(
            Dialect::Sqlite,
            &UpsertInput {
                table: "users",
                primary_keys: &pk,
                identity: Some("id"),
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "INSERT INTO users (id, name) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"
        );
        assert_eq!(plan.key, KeyRetrieval::Supplied(Value::Int(7)));
    }

    #[test]
    fn test_sqlserver_merge() {
        let pk = keys(&["id"]);
        let record = Record::new().set("id", 0).set("name", "a");
        let plan = build_upsert(
            Dialect::SqlServer,
            &UpsertInput {
                table: "users",
                primary_keys: &pk,
                identity: Some("id"),
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "MERGE INTO users t USING (SELECT ? AS id, ? AS name) AS s ON (t.id = s.id) \
             WHEN MATCHED THEN UPDATE SET t.name = s.name \
             WHEN NOT MATCHED THEN INSERT (name) VALUES (s.name); \
             SELECT CAST(SCOPE_IDENTITY() AS BIGINT) AS id"
        );
        assert_eq!(plan.args.len(), 2);
        assert_eq!(plan.key, KeyRetrieval::ScopeIdentity);
    }

    #[test]
    fn test_oracle_merge_without_update_side() {
        let pk = keys(&["id"]);
        let record = Record::new().set("id", 5);
        let plan = build_upsert(
            Dialect::Oracle,
            &UpsertInput {
                table: "flags",
                primary_keys: &pk,
                identity: None,
                record: &record,
            },
        )
        .unwrap();
        assert_eq!(
            plan.sql,
            "MERGE INTO flags t USING (SELECT ? AS id FROM DUAL) s ON (t.id = s.id) \
             WHEN NOT MATCHED THEN INSERT (id) VALUES (s.id)"
        );
        assert_eq!(plan.key, KeyRetrieval::Supplied(Value::Int(5)));
    }

    #[test]
    fn test_upsert_requires_key_columns() {
        let pk = keys(&["code"]);
        let record = Record::new().set("name", "a");
        let err = build_upsert(
            Dialect::Postgres,
            &UpsertInput {
                table: "tags",
                primary_keys: &pk,
                identity: None,
                record: &record,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let pk = keys(&["id"]);
        let record = Record::new().set("id", 1).set("name; DROP", "a");
        let err = build_upsert(
            Dialect::MySql,
            &UpsertInput {
                table: "users",
                primary_keys: &pk,
                identity: None,
                record: &record,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_insert_key_retrieval_per_dialect() {
        let pk = keys(&["id"]);
        let record = Record::new().set("name", "a");
        let input = UpsertInput {
            table: "users",
            primary_keys: &pk,
            identity: Some("id"),
            record: &record,
        };
        let pg = build_insert(Dialect::Postgres, &input).unwrap();
        assert_eq!(pg.sql, "INSERT INTO users (name) VALUES (?) RETURNING id");
        let my = build_insert(Dialect::MySql, &input).unwrap();
        assert_eq!(my.key, KeyRetrieval::LastInsertId);
        let ora = build_insert(Dialect::Oracle, &input).unwrap();
        assert_eq!(ora.sql, "INSERT INTO users (name) VALUES (?)");
        assert_eq!(ora.key, KeyRetrieval::ReturningInto("id".to_string()));
        let ms = build_insert(Dialect::SqlServer, &input).unwrap();
        assert!(ms.sql.ends_with("; SELECT CAST(SCOPE_IDENTITY() AS BIGINT) AS id"));
    }

    #[test]
    fn test_update_with_version() {
        let set = Record::new().set("name", "n");
        let plan = build_update("users", &set, "id = ?", &[Value::Int(1)], Some(&Value::Int(4)))
            .unwrap();
        assert_eq!(
            plan.sql,
            "UPDATE users SET name = ?, version = version + 1 WHERE (id = ?) AND version = ?"
        );
        assert_eq!(plan.args, vec![Value::from("n"), Value::Int(1), Value::Int(4)]);
    }

    #[test]
    fn test_delete_requires_where() {
        assert!(build_delete("users", "  ", &[], None).is_err());
        let soft = build_delete("users", "id = ?", &[Value::Int(1)], Some(Value::from("now"))).unwrap();
        assert_eq!(soft.sql, "UPDATE users SET deleted_at = ? WHERE id = ?");
        assert_eq!(soft.args, vec![Value::from("now"), Value::Int(1)]);
    }
}
