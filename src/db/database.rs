//! Logical database: the execution entry points.
//!
//! A [`Database`] owns one driver and everything the core keeps per database:
//! the statement cache, the pagination count cache, table metadata, the query
//! tracer and the health monitor. All entry points render their SQL through
//! [`prepare_statement`] and are bounded by the configured query timeout; the
//! `*_within` variants take an explicit deadline instead.

use crate::config::EngineOptions;
use crate::db::count_cache::CountCache;
use crate::db::driver::{Driver, PreparedStatement};
use crate::db::metadata::{MetadataCache, TableMeta, introspection_sql};
use crate::db::monitor::{HealthMonitor, MonitorStatus};
use crate::db::stmt_cache::StatementCache;
use crate::db::tracer::{QueryEvent, QueryTracer, traced};
use crate::db::transaction::Transaction;
use crate::dialect::{
    Dialect, PageWindow, PaginationStyle, ROWNUM_COLUMN, Sanitized, build_window_sql,
    optimize_count_sql, prepare_statement, translate,
};
use crate::error::{DbError, DbResult};
use crate::models::{CacheStats, ExecResult, FeatureFlags, Page, Record, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

fn timeout_error(operation: &str, deadline: Duration) -> DbError {
    DbError::timeout(operation, deadline)
}

#[derive(Debug)]
pub struct Database {
    name: String,
    dialect: Dialect,
    driver: Arc<dyn Driver>,
    features: FeatureFlags,
    options: EngineOptions,
    tracer: Arc<dyn QueryTracer>,
    stmt_cache: StatementCache,
    count_cache: CountCache,
    metadata: MetadataCache,
    monitor: Option<HealthMonitor>,
}

impl Database {
    /// Wrap `driver` as the database `name`.
    ///
    /// Starts the health monitor when `options.monitor_enabled` is set, which
    /// requires a running tokio runtime.
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        features: FeatureFlags,
        options: EngineOptions,
        tracer: Arc<dyn QueryTracer>,
    ) -> Self {
        let name = name.into();
        let dialect = driver.dialect();
        let stmt_cache = StatementCache::new(
            name.clone(),
            options.stmt_cache_capacity,
            driver.settings().statement_ttl(),
        );
        let monitor = options
            .monitor_enabled
            .then(|| HealthMonitor::start(name.clone(), Arc::clone(&driver), options.monitor));

        Self {
            count_cache: CountCache::new(name.clone()),
            name,
            dialect,
            driver,
            features,
            options,
            tracer,
            stmt_cache,
            metadata: MetadataCache::new(),
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn QueryTracer> {
        &self.tracer
    }

    // =========================================================================
    // Query entry points
    // =========================================================================

    /// Run a row-returning statement written with `?` markers.
    pub async fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Record>> {
        self.query_within(sql, args, self.options.query_timeout).await
    }

    pub async fn query_within(
        &self,
        sql: &str,
        args: &[Value],
        deadline: Duration,
    ) -> DbResult<Vec<Record>> {
        let stmt = self.render(sql, args)?;
        self.fetch(&stmt, deadline).await
    }

    /// Run a row-returning statement and keep only the first row.
    pub async fn query_first(&self, sql: &str, args: &[Value]) -> DbResult<Option<Record>> {
        self.query_first_within(sql, args, self.options.query_timeout)
            .await
    }

    pub async fn query_first_within(
        &self,
        sql: &str,
        args: &[Value],
        deadline: Duration,
    ) -> DbResult<Option<Record>> {
        Ok(self
            .query_within(sql, args, deadline)
            .await?
            .into_iter()
            .next())
    }

    /// Run a statement and report the affected row count.
    pub async fn exec(&self, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.exec_within(sql, args, self.options.query_timeout).await
    }

    pub async fn exec_within(
        &self,
        sql: &str,
        args: &[Value],
        deadline: Duration,
    ) -> DbResult<ExecResult> {
        let stmt = self.render(sql, args)?;
        let started_at = Instant::now();
        let (result, from_cache) = match timeout(deadline, self.pooled_exec(&stmt)).await {
            Ok(outcome) => outcome,
            Err(_) => (Err(timeout_error("statement execution", deadline)), false),
        };
        self.observe(started_at, &stmt, from_cache, result)
    }

    /// Run a plain insert through the driver's output-bind support.
    pub(crate) async fn exec_returning_into(
        &self,
        sql: &str,
        args: &[Value],
        column: &str,
    ) -> DbResult<(ExecResult, Value)> {
        let stmt = self.render(sql, args)?;
        let deadline = self.options.query_timeout;
        let started_at = Instant::now();
        let result = timeout(
            deadline,
            self.driver
                .exec_returning_into(&stmt.sql, &stmt.args, column),
        )
        .await
        .unwrap_or_else(|_| Err(timeout_error("statement execution", deadline)));
        self.observe(started_at, &stmt, false, result)
    }

    /// One page of `sql` plus the total row count.
    ///
    /// `page` is clamped to at least 1 and `page_size` to `[1, max_page_size]`.
    /// A non-zero `count_cache_ttl` caches the total for that long.
    pub async fn paginate(
        &self,
        sql: &str,
        page: i64,
        page_size: i64,
        count_cache_ttl: Duration,
        args: &[Value],
    ) -> DbResult<Page> {
        let window = PageWindow::clamp(page, page_size, self.options.max_page_size);
        let deadline = self.options.query_timeout;

        let count_stmt = self.render(&optimize_count_sql(sql, self.dialect), args)?;
        let cached = if count_cache_ttl.is_zero() {
            None
        } else {
            self.count_cache.get(&count_stmt.sql, &count_stmt.args)
        };
        let total = match cached {
            Some(total) => {
                debug!(database = %self.name, sql = %count_stmt.sql, total, "Count cache hit");
                total
            }
            None => {
                let rows = self.fetch(&count_stmt, deadline).await?;
                let total = count_value(&rows)?;
                self.count_cache
                    .insert(&count_stmt.sql, &count_stmt.args, total, count_cache_ttl);
                total
            }
        };

        let records = if window.offset() >= total {
            Vec::new()
        } else {
            let window_stmt = self.render(&build_window_sql(sql, self.dialect, window), args)?;
            let mut records = self.fetch(&window_stmt, deadline).await?;
            if self.dialect.descriptor().pagination == PaginationStyle::RowNum {
                for record in &mut records {
                    record.remove(ROWNUM_COLUMN);
                }
            }
            records
        };

        Ok(Page {
            records,
            total,
            page: window.page,
            page_size: window.page_size,
            total_pages: window.total_pages(total),
        })
    }

    // =========================================================================
    // Statement cache
    // =========================================================================

    /// Prepared handle for `sql`, and whether it came from the cache.
    pub async fn get_or_prepare_stmt(
        &self,
        sql: &str,
    ) -> DbResult<(Arc<dyn PreparedStatement>, bool)> {
        self.stmt_cache
            .get_or_prepare(self.driver.as_ref(), &translate(sql, self.dialect))
            .await
    }

    /// Drop the cached statement for `sql`. Returns whether one existed.
    pub fn invalidate_stmt(&self, sql: &str) -> bool {
        self.stmt_cache.invalidate(&translate(sql, self.dialect))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stmt_cache.stats()
    }

    pub fn count_cache_len(&self) -> usize {
        self.count_cache.len()
    }

    // =========================================================================
    // Metadata, health, lifecycle
    // =========================================================================

    /// Columns, key and identity column of `table`, introspected once.
    pub async fn table_meta(&self, table: &str) -> DbResult<Arc<TableMeta>> {
        self.metadata
            .get_or_load(table, move || async move {
                let rows = self
                    .query(introspection_sql(self.dialect), &[Value::from(table)])
                    .await?;
                TableMeta::from_rows(table, self.dialect, &rows)
            })
            .await
    }

    /// Forget cached metadata for `table` after it was altered.
    pub async fn invalidate_table(&self, table: &str) -> bool {
        self.metadata.invalidate(table).await
    }

    /// Round-trip to the backend, bounded by the monitor's ping timeout.
    pub async fn ping(&self) -> DbResult<()> {
        let deadline = self.options.monitor.ping_timeout;
        timeout(deadline, self.driver.ping())
            .await
            .unwrap_or_else(|_| Err(timeout_error("ping", deadline)))
    }

    /// Health as seen by the monitor, or from a one-off ping when none runs.
    pub async fn health(&self) -> MonitorStatus {
        match &self.monitor {
            Some(monitor) => monitor.status(),
            None => MonitorStatus::from_check(self.ping().await.map_err(|e| e.to_string())),
        }
    }

    /// Start a transaction on a dedicated connection.
    pub async fn begin(&self) -> DbResult<Transaction> {
        let deadline = self.options.query_timeout;
        let inner = timeout(deadline, self.driver.begin())
            .await
            .unwrap_or_else(|_| Err(timeout_error("begin transaction", deadline)))?;
        Ok(Transaction::new(self, inner))
    }

    /// Stop the monitor, drop cached state and close the driver pool.
    pub async fn close(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }
        self.stmt_cache.clear();
        self.count_cache.clear();
        self.metadata.clear().await;
        self.driver.close().await;
        info!(database = %self.name, "Database closed");
    }

    // =========================================================================
    // Execution path
    // =========================================================================

    fn render(&self, sql: &str, args: &[Value]) -> DbResult<Sanitized> {
        let stmt = prepare_statement(sql, self.dialect, args);
        stmt.ensure_complete()?;
        Ok(stmt)
    }

    async fn fetch(&self, stmt: &Sanitized, deadline: Duration) -> DbResult<Vec<Record>> {
        let started_at = Instant::now();
        let (result, from_cache) = match timeout(deadline, self.pooled_query(stmt)).await {
            Ok(outcome) => outcome,
            Err(_) => (Err(timeout_error("query execution", deadline)), false),
        };
        self.observe(started_at, stmt, from_cache, result)
    }

    // Statements without markers run unprepared, like DDL the backend may refuse to prepare.
    async fn pooled_query(&self, stmt: &Sanitized) -> (DbResult<Vec<Record>>, bool) {
        if stmt.args.is_empty() {
            return (self.driver.query(&stmt.sql, &stmt.args).await, false);
        }
        match self
            .stmt_cache
            .get_or_prepare(self.driver.as_ref(), &stmt.sql)
            .await
        {
            Ok((handle, from_cache)) => (handle.query(&stmt.args).await, from_cache),
            Err(e) => (Err(e), false),
        }
    }

    async fn pooled_exec(&self, stmt: &Sanitized) -> (DbResult<ExecResult>, bool) {
        if stmt.args.is_empty() {
            return (self.driver.exec(&stmt.sql, &stmt.args).await, false);
        }
        match self
            .stmt_cache
            .get_or_prepare(self.driver.as_ref(), &stmt.sql)
            .await
        {
            Ok((handle, from_cache)) => (handle.exec(&stmt.args).await, from_cache),
            Err(e) => (Err(e), false),
        }
    }

    fn observe<T>(
        &self,
        started_at: Instant,
        stmt: &Sanitized,
        from_cache: bool,
        result: DbResult<T>,
    ) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_stale_connection() && self.stmt_cache.invalidate(&stmt.sql) {
                warn!(
                    database = %self.name,
                    sql = %stmt.sql,
                    error = %e,
                    "Dropped cached statement after connection failure"
                );
            }
        }
        traced(
            self.tracer.as_ref(),
            QueryEvent {
                started_at,
                elapsed: Duration::ZERO,
                database: &self.name,
                sql: &stmt.sql,
                args: &stmt.args,
                error: None,
                from_cache,
                transaction_id: None,
            },
            result,
        )
    }
}

/// First column of the first row of a COUNT query.
fn count_value(rows: &[Record]) -> DbResult<u64> {
    rows.first()
        .and_then(|row| row.value_at(0))
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| DbError::internal("COUNT query returned no numeric value"))
}
