//! COUNT and row-window SQL generation for pagination.
//!
//! Each pagination style has its own window builder so a dialect's rules can be
//! tested in isolation. Executing the generated statements, and caching the count,
//! is the job of [`Database::paginate`](crate::db::Database::paginate).

use super::scanner::{
    count_unquoted, find_top_level_keyword, is_simple_select, limits_rows, split_order_by,
    strip_terminator,
};
use super::{Dialect, PaginationStyle};

/// Helper column added by the Oracle window; removed from returned records.
pub const ROWNUM_COLUMN: &str = "rn";

/// A clamped page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// 1-based page number
    pub page: u64,
    pub page_size: u64,
}

impl PageWindow {
    /// Clamp `page` to `>= 1` and `page_size` to `[1, max_page_size]`.
    pub fn clamp(page: i64, page_size: i64, max_page_size: u64) -> Self {
        let max_page_size = max_page_size.max(1);
        Self {
            page: u64::try_from(page).unwrap_or(0).max(1),
            page_size: u64::try_from(page_size)
                .unwrap_or(0)
                .clamp(1, max_page_size),
        }
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.page_size)
    }
}

/// Count query with the projection replaced in place, if the query allows it.
fn rewrite_projection(base: &str) -> Option<String> {
    if !is_simple_select(base) {
        return None;
    }
    let from = find_top_level_keyword(base, "FROM")?;
    // Markers in the projection would shift the argument positions.
    if count_unquoted(&base[..from], b'?') > 0 {
        return None;
    }
    Some(format!("SELECT COUNT(*) {}", &base[from..]))
}

/// Derived-table alias; Oracle does not accept `AS` before it.
fn subquery_alias(dialect: Dialect) -> &'static str {
    if dialect.descriptor().subquery_alias_as {
        "AS sub"
    } else {
        "sub"
    }
}

/// Wrap a query as `SELECT COUNT(*) FROM (base) AS sub`.
pub fn wrap_count_sql(base: &str, dialect: Dialect) -> String {
    format!("SELECT COUNT(*) FROM ({base}) {}", subquery_alias(dialect))
}

/// COUNT query for a paginated statement.
///
/// The trailing terminator and top-level `ORDER BY` are dropped. A simple query
/// has its projection replaced by `COUNT(*)`; anything else is wrapped. A query
/// that already limits its rows is wrapped whole, ordering included.
///
/// ```
/// use sqlweave::dialect::{Dialect, optimize_count_sql};
///
/// assert_eq!(
///     optimize_count_sql("SELECT a,b FROM t WHERE x=1", Dialect::MySql),
///     "SELECT COUNT(*) FROM t WHERE x=1"
/// );
/// assert_eq!(
///     optimize_count_sql("SELECT DISTINCT a FROM t", Dialect::MySql),
///     "SELECT COUNT(*) FROM (SELECT DISTINCT a FROM t) AS sub"
/// );
/// ```
pub fn optimize_count_sql(sql: &str, dialect: Dialect) -> String {
    if limits_rows(sql) {
        return wrap_count_sql(strip_terminator(sql), dialect);
    }
    let (base, _) = split_order_by(sql);
    rewrite_projection(base).unwrap_or_else(|| wrap_count_sql(base, dialect))
}

/// Window builder for one pagination style.
trait WindowBuilder {
    fn build(&self, base: &str, order_by: Option<&str>, window: PageWindow) -> String;
}

struct LimitOffset;
struct OffsetFetch;
struct RowNum;

fn window_builder(style: PaginationStyle) -> &'static dyn WindowBuilder {
    match style {
        PaginationStyle::LimitOffset => &LimitOffset,
        PaginationStyle::OffsetFetch => &OffsetFetch,
        PaginationStyle::RowNum => &RowNum,
    }
}

fn with_order(base: &str, order_by: Option<&str>) -> String {
    match order_by {
        Some(order_by) => format!("{base} {order_by}"),
        None => base.to_string(),
    }
}

impl WindowBuilder for LimitOffset {
    fn build(&self, base: &str, order_by: Option<&str>, window: PageWindow) -> String {
        format!(
            "{} LIMIT {} OFFSET {}",
            with_order(base, order_by),
            window.page_size,
            window.offset()
        )
    }
}

impl WindowBuilder for OffsetFetch {
    fn build(&self, base: &str, order_by: Option<&str>, window: PageWindow) -> String {
        // OFFSET/FETCH is only valid after an ORDER BY.
        let order_by = order_by.unwrap_or("ORDER BY (SELECT NULL)");
        format!(
            "{base} {order_by} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            window.offset(),
            window.page_size
        )
    }
}

impl WindowBuilder for RowNum {
    fn build(&self, base: &str, order_by: Option<&str>, window: PageWindow) -> String {
        let order_by = order_by.unwrap_or("ORDER BY 1");
        let offset = window.offset();
        format!(
            "SELECT * FROM (SELECT a.*, ROWNUM {ROWNUM_COLUMN} FROM ({base} {order_by}) a \
             WHERE ROWNUM <= {}) WHERE {ROWNUM_COLUMN} > {offset}",
            offset.saturating_add(window.page_size)
        )
    }
}

/// Data query returning one page of `sql` for `dialect`.
///
/// A query with its own `LIMIT`, `OFFSET`, `FETCH` or `TOP` is paged as a
/// derived table so the window applies to the rows it already selected.
pub fn build_window_sql(sql: &str, dialect: Dialect, window: PageWindow) -> String {
    let builder = window_builder(dialect.descriptor().pagination);
    let sql = strip_terminator(sql);
    if limits_rows(sql) {
        let base = format!("SELECT * FROM ({sql}) {}", subquery_alias(dialect));
        return builder.build(&base, None, window);
    }
    let (base, order_by) = split_order_by(sql);
    builder.build(base, order_by, window)
}
