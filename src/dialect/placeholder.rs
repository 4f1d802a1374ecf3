//! Placeholder translation and argument sanitizing.
//!
//! Statements are written once with the uniform `?` marker. Before they reach a
//! driver they are rendered for the target dialect and the argument list is
//! normalized against the markers that are actually present.

use super::scanner::{count_unquoted, mask};
use super::{Dialect, PlaceholderStyle};
use crate::error::{DbError, DbResult};
use crate::models::{TIMESTAMP_FORMAT, Value};
use regex::bytes::Regex;
use std::sync::LazyLock;

static DOLLAR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("dollar marker regex"));
static COLON_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)").expect("colon marker regex"));
static ATP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)@p(\d+)").expect("@p marker regex"));

/// A statement ready for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    /// Final dialect-specific SQL
    pub sql: String,
    /// Arguments truncated to the marker count, references resolved
    pub args: Vec<Value>,
    /// Number of markers found in `sql`
    pub markers: usize,
}

impl Sanitized {
    /// Reject statements that have more markers than arguments.
    pub fn ensure_complete(&self) -> DbResult<()> {
        if self.args.len() < self.markers {
            return Err(DbError::invalid_input(format!(
                "statement has {} placeholder(s) but only {} argument(s) were supplied",
                self.markers,
                self.args.len()
            )));
        }
        Ok(())
    }
}

/// Rewrite `?` markers for `dialect`, numbering from 1.
pub fn translate(sql: &str, dialect: Dialect) -> String {
    translate_from(sql, dialect, 0)
}

/// Rewrite `?` markers for `dialect`, numbering from `start + 1`.
///
/// Markers inside literals, quoted identifiers and comments are left alone.
pub fn translate_from(sql: &str, dialect: Dialect, start: usize) -> String {
    let style = dialect.placeholder();
    if !style.is_numbered() {
        return sql.to_string();
    }

    let masked = mask(sql);
    let mut out = String::with_capacity(sql.len() + 16);
    let mut last = 0;
    let mut index = start;
    for (pos, &b) in masked.iter().enumerate() {
        if b == b'?' {
            index += 1;
            out.push_str(&sql[last..pos]);
            out.push_str(&style.marker(index));
            last = pos + 1;
        }
    }
    out.push_str(&sql[last..]);
    out
}

fn marker_regex(style: PlaceholderStyle) -> Option<&'static Regex> {
    match style {
        PlaceholderStyle::Question => None,
        PlaceholderStyle::Dollar => Some(&DOLLAR_MARKER),
        PlaceholderStyle::Colon => Some(&COLON_MARKER),
        PlaceholderStyle::AtP => Some(&ATP_MARKER),
    }
}

fn marker_index(digits: &[u8]) -> Option<usize> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Count the markers in an already rendered statement.
///
/// Numbered styles report the highest index found; `?` styles count markers.
pub fn count_markers(sql: &str, dialect: Dialect) -> usize {
    match marker_regex(dialect.placeholder()) {
        None => count_unquoted(sql, b'?'),
        Some(re) => {
            let masked = mask(sql);
            re.captures_iter(&masked)
                .filter_map(|caps| caps.get(1).and_then(|m| marker_index(m.as_bytes())))
                .max()
                .unwrap_or(0)
        }
    }
}

/// Normalize `args` against the markers of a rendered statement.
///
/// The argument list is cut down to the marker count and references are resolved.
/// For Oracle, timestamp arguments are sent as text and their markers wrapped in
/// `TO_DATE(...)`.
pub fn sanitize_args(sql: String, dialect: Dialect, args: &[Value]) -> Sanitized {
    let markers = count_markers(&sql, dialect);
    let args: Vec<Value> = args
        .iter()
        .take(markers)
        .cloned()
        .map(Value::resolve)
        .collect();

    if dialect == Dialect::Oracle {
        return oracle_dates(sql, args, markers);
    }

    Sanitized { sql, args, markers }
}

fn oracle_dates(sql: String, mut args: Vec<Value>, markers: usize) -> Sanitized {
    let mut date_markers = Vec::new();
    for (idx, arg) in args.iter_mut().enumerate() {
        if let Value::Timestamp(ts) = arg {
            *arg = Value::Text(ts.format(TIMESTAMP_FORMAT).to_string());
            date_markers.push(idx + 1);
        }
    }
    if date_markers.is_empty() {
        return Sanitized { sql, args, markers };
    }

    let masked = mask(&sql);
    let mut out = String::with_capacity(sql.len() + date_markers.len() * 32);
    let mut last = 0;
    for caps in COLON_MARKER.captures_iter(&masked) {
        let (Some(whole), Some(digits)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(index) = marker_index(digits.as_bytes()) else {
            continue;
        };
        if date_markers.contains(&index) {
            out.push_str(&sql[last..whole.start()]);
            out.push_str(&format!("TO_DATE(:{index}, 'YYYY-MM-DD HH24:MI:SS')"));
            last = whole.end();
        }
    }
    out.push_str(&sql[last..]);

    Sanitized {
        sql: out,
        args,
        markers,
    }
}

/// Translate and sanitize in one step. Every execution path renders through here.
pub fn prepare_statement(sql: &str, dialect: Dialect, args: &[Value]) -> Sanitized {
    sanitize_args(translate(sql, dialect), dialect, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    #[test]
    fn test_translate_unchanged_for_question_styles() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(translate(sql, Dialect::MySql), sql);
        assert_eq!(translate(sql, Dialect::Sqlite), sql);
    }

    #[test]
    fn test_translate_numbered_styles() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(
            translate(sql, Dialect::Postgres),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(
            translate(sql, Dialect::Oracle),
            "SELECT * FROM t WHERE a = :1 AND b = :2"
        );
        assert_eq!(
            translate(sql, Dialect::SqlServer),
            "SELECT * FROM t WHERE a = @p1 AND b = @p2"
        );
    }

    #[test]
    fn test_translate_from_offset() {
        assert_eq!(
            translate_from("a = ? AND b = ?", Dialect::Postgres, 2),
            "a = $3 AND b = $4"
        );
    }

    #[test]
    fn test_question_mark_in_literal_untouched() {
        let sql = "SELECT '?' AS q, \"a?\" FROM t WHERE x = ? -- why?\n";
        assert_eq!(
            translate(sql, Dialect::Postgres),
            "SELECT '?' AS q, \"a?\" FROM t WHERE x = $1 -- why?\n"
        );
        assert_eq!(count_markers(sql, Dialect::MySql), 1);
    }

    #[test]
    fn test_count_numbered_markers_uses_highest_index() {
        assert_eq!(count_markers("a = $1 OR b = $1 OR c = $12", Dialect::Postgres), 12);
        assert_eq!(count_markers("a = @P2", Dialect::SqlServer), 2);
        assert_eq!(count_markers("a = ':5'", Dialect::Oracle), 0);
    }

    #[test]
    fn test_sanitize_truncates_to_markers() {
        let args = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let out = prepare_statement("SELECT * FROM t WHERE a = ? AND b = ?", Dialect::Postgres, &args);
        assert_eq!(out.markers, 2);
        assert_eq!(out.args, vec![Value::Int(1), Value::Int(2)]);
        assert!(out.ensure_complete().is_ok());
    }

    #[test]
    fn test_sanitize_reports_missing_args() {
        let out = prepare_statement("SELECT ? , ?", Dialect::MySql, &[Value::Int(1)]);
        assert_eq!(out.args.len(), 1);
        let err = out.ensure_complete().unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_sanitize_resolves_references() {
        let shared = Arc::new(Value::from("x"));
        let args = vec![Value::Ref(None), Value::Ref(Some(shared))];
        let out = prepare_statement("INSERT INTO t VALUES (?, ?)", Dialect::Sqlite, &args);
        assert_eq!(out.args, vec![Value::Null, Value::Text("x".to_string())]);
    }

    #[test]
    fn test_oracle_timestamps_become_to_date() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(17, 5, 0)
            .unwrap();
        let args = vec![Value::Int(1), Value::Timestamp(ts)];
        let out = prepare_statement("UPDATE t SET a = ?, b = ?", Dialect::Oracle, &args);
        assert_eq!(
            out.sql,
            "UPDATE t SET a = :1, b = TO_DATE(:2, 'YYYY-MM-DD HH24:MI:SS')"
        );
        assert_eq!(out.args[1], Value::Text("2024-03-09 17:05:00".to_string()));
    }

    #[test]
    fn test_timestamps_untouched_elsewhere() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let out = prepare_statement("SELECT ?", Dialect::Postgres, &[Value::Timestamp(ts)]);
        assert_eq!(out.sql, "SELECT $1");
        assert_eq!(out.args, vec![Value::Timestamp(ts)]);
    }
}
