//! Shared fixtures for integration tests.
//!
//! `FakeDriver` is an in-memory backend over a fixed table of numbered rows.
//! It understands just enough SQL to answer the statements the core generates:
//! `COUNT(*)` queries and the three row-window shapes.

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use sqlweave::config::EngineOptions;
use sqlweave::db::{
    Database, Driver, DriverTransaction, PoolSettings, PreparedStatement, QueryEvent, QueryTracer,
};
use sqlweave::dialect::Dialect;
use sqlweave::error::{DbError, DbResult};
use sqlweave::models::{ExecResult, FeatureFlags, Record, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

static LIMIT_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LIMIT (\d+) OFFSET (\d+)").unwrap());
static OFFSET_FETCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OFFSET (\d+) ROWS FETCH NEXT (\d+) ROWS ONLY").unwrap());
static ROWNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ROWNUM <= (\d+)\) WHERE rn > (\d+)").unwrap());

#[derive(Debug, Default)]
pub struct FakeState {
    pub prepares: AtomicUsize,
    pub pings: AtomicUsize,
    pub fail_ping: AtomicBool,
    pub fail_prepare: AtomicBool,
    /// When set, prepared statements fail with this database error message
    pub fail_query: Mutex<Option<String>>,
    /// Final SQL of every executed statement, in order
    pub executed: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn fail_queries_with(&self, message: Option<&str>) {
        *self.fail_query.lock().unwrap() = message.map(str::to_string);
    }

    fn query_failure(&self) -> DbResult<()> {
        match self.fail_query.lock().unwrap().as_deref() {
            Some(message) => Err(DbError::database(message, None, "retry the statement")),
            None => Ok(()),
        }
    }

    pub fn count_queries(&self) -> usize {
        self.executed()
            .iter()
            .filter(|sql| sql.contains("COUNT(*)"))
            .count()
    }
}

#[derive(Debug)]
pub struct FakeDriver {
    dialect: Dialect,
    rows: u64,
    prepare_delay: Duration,
    pub state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new(dialect: Dialect, rows: u64) -> Self {
        Self {
            dialect,
            rows,
            prepare_delay: Duration::ZERO,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }
}

fn row(id: u64) -> Record {
    Record::new().set("id", id).set("name", format!("row{id}"))
}

/// Answer `sql` against `total` rows numbered from 1.
///
/// An integer first argument filters to ids greater than it.
fn answer(state: &FakeState, total: u64, sql: &str, args: &[Value]) -> DbResult<Vec<Record>> {
    state.executed.lock().unwrap().push(sql.to_string());
    let floor = args.first().and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
    let ids: Vec<u64> = (1..=total).filter(|id| *id > floor).collect();

    if sql.contains("COUNT(*)") {
        return Ok(vec![Record::new().set("COUNT(*)", ids.len() as u64)]);
    }

    let number = |caps: &regex::Captures<'_>, idx: usize| -> u64 {
        caps.get(idx)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    let page = |offset: u64, size: u64| -> Vec<Record> {
        ids.iter()
            .skip(offset as usize)
            .take(size as usize)
            .map(|id| row(*id))
            .collect()
    };

    if let Some(caps) = LIMIT_OFFSET.captures(sql) {
        return Ok(page(number(&caps, 2), number(&caps, 1)));
    }
    if let Some(caps) = OFFSET_FETCH.captures(sql) {
        return Ok(page(number(&caps, 1), number(&caps, 2)));
    }
    if let Some(caps) = ROWNUM.captures(sql) {
        let (end, offset) = (number(&caps, 1), number(&caps, 2));
        return Ok(page(offset, end.saturating_sub(offset))
            .into_iter()
            .enumerate()
            .map(|(idx, mut record)| {
                record.insert("rn", offset + idx as u64 + 1);
                record
            })
            .collect());
    }
    Ok(ids.into_iter().map(row).collect())
}

#[derive(Debug)]
struct FakeStatement {
    sql: String,
    rows: u64,
    state: Arc<FakeState>,
}

#[async_trait]
impl PreparedStatement for FakeStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn query(&self, args: &[Value]) -> DbResult<Vec<Record>> {
        self.state.query_failure()?;
        answer(&self.state, self.rows, &self.sql, args)
    }

    async fn exec(&self, _args: &[Value]) -> DbResult<ExecResult> {
        self.state.query_failure()?;
        self.state.executed.lock().unwrap().push(self.sql.clone());
        Ok(ExecResult::new(1, None))
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn settings(&self) -> PoolSettings {
        PoolSettings::default()
    }

    async fn prepare(&self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>> {
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        if !self.prepare_delay.is_zero() {
            tokio::time::sleep(self.prepare_delay).await;
        }
        if self.state.fail_prepare.load(Ordering::SeqCst) {
            return Err(DbError::database("prepare refused", None, "check the SQL"));
        }
        Ok(Arc::new(FakeStatement {
            sql: sql.to_string(),
            rows: self.rows,
            state: Arc::clone(&self.state),
        }))
    }

    async fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Record>> {
        answer(&self.state, self.rows, sql, args)
    }

    async fn exec(&self, sql: &str, _args: &[Value]) -> DbResult<ExecResult> {
        self.state.executed.lock().unwrap().push(sql.to_string());
        Ok(ExecResult::new(0, None))
    }

    async fn begin(&self) -> DbResult<Box<dyn DriverTransaction>> {
        Err(DbError::unsupported(self.dialect, "transactions"))
    }

    async fn ping(&self) -> DbResult<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "check the server"));
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// An owned copy of a [`QueryEvent`].
#[derive(Debug, Clone)]
pub struct TracedQuery {
    pub sql: String,
    pub args: Vec<Value>,
    pub failed: bool,
    pub from_cache: bool,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TracedQuery>>,
}

impl RecordingTracer {
    pub fn events(&self) -> Vec<TracedQuery> {
        self.events.lock().unwrap().clone()
    }
}

impl QueryTracer for RecordingTracer {
    fn trace(&self, event: &QueryEvent<'_>) {
        self.events.lock().unwrap().push(TracedQuery {
            sql: event.sql.to_string(),
            args: event.args.to_vec(),
            failed: event.error.is_some(),
            from_cache: event.from_cache,
            transaction_id: event.transaction_id.map(str::to_string),
        });
    }
}

/// Engine options for tests: no background monitor.
pub fn quiet_options() -> EngineOptions {
    EngineOptions {
        monitor_enabled: false,
        ..EngineOptions::default()
    }
}

/// A database over a [`FakeDriver`], returning the driver state for assertions.
pub fn fake_database(
    dialect: Dialect,
    rows: u64,
) -> (Database, Arc<FakeState>, Arc<RecordingTracer>) {
    let driver = FakeDriver::new(dialect, rows);
    let state = Arc::clone(&driver.state);
    let tracer = Arc::new(RecordingTracer::default());
    let db = Database::new(
        "fake",
        Arc::new(driver),
        FeatureFlags::default(),
        quiet_options(),
        tracer.clone(),
    );
    (db, state, tracer)
}
