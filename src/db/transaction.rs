//! Transactional execution.
//!
//! A [`Transaction`] holds one dedicated connection until it is committed or
//! rolled back. Statements are rendered and traced like pooled ones but never
//! touch the statement cache. Dropping an unfinished transaction lets the
//! driver roll it back when the connection returns to the pool.

use crate::db::database::Database;
use crate::db::driver::DriverTransaction;
use crate::db::tracer::{QueryEvent, QueryTracer, traced};
use crate::dialect::{Dialect, prepare_statement};
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Record, TransactionState, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct Transaction {
    id: String,
    database: String,
    dialect: Dialect,
    query_timeout: Duration,
    tracer: Arc<dyn QueryTracer>,
    inner: Option<Box<dyn DriverTransaction>>,
    state: TransactionState,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(db: &Database, inner: Box<dyn DriverTransaction>) -> Self {
        let id = format!("tx_{}", uuid::Uuid::new_v4());
        debug!(database = %db.name(), transaction_id = %id, "Transaction started");
        Self {
            id,
            database: db.name().to_string(),
            dialect: db.dialect(),
            query_timeout: db.options().query_timeout,
            tracer: Arc::clone(db.tracer()),
            inner: Some(inner),
            state: TransactionState::Active,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn active(&mut self) -> DbResult<&mut Box<dyn DriverTransaction>> {
        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(DbError::transaction(
                format!("transaction is already {:?}", self.state),
                self.id.clone(),
            )),
        }
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Record>> {
        let stmt = prepare_statement(sql, self.dialect, args);
        stmt.ensure_complete()?;
        let deadline = self.query_timeout;
        let started_at = Instant::now();
        let result = match self.active() {
            Ok(inner) => timeout(deadline, inner.query(&stmt.sql, &stmt.args))
                .await
                .unwrap_or_else(|_| Err(DbError::timeout("query execution", deadline))),
            Err(e) => return Err(e),
        };
        traced(
            self.tracer.as_ref(),
            QueryEvent {
                started_at,
                elapsed: Duration::ZERO,
                database: &self.database,
                sql: &stmt.sql,
                args: &stmt.args,
                error: None,
                from_cache: false,
                transaction_id: Some(&self.id),
            },
            result,
        )
    }

    pub async fn query_first(&mut self, sql: &str, args: &[Value]) -> DbResult<Option<Record>> {
        Ok(self.query(sql, args).await?.into_iter().next())
    }

    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let stmt = prepare_statement(sql, self.dialect, args);
        stmt.ensure_complete()?;
        let deadline = self.query_timeout;
        let started_at = Instant::now();
        let result = match self.active() {
            Ok(inner) => timeout(deadline, inner.exec(&stmt.sql, &stmt.args))
                .await
                .unwrap_or_else(|_| Err(DbError::timeout("statement execution", deadline))),
            Err(e) => return Err(e),
        };
        traced(
            self.tracer.as_ref(),
            QueryEvent {
                started_at,
                elapsed: Duration::ZERO,
                database: &self.database,
                sql: &stmt.sql,
                args: &stmt.args,
                error: None,
                from_cache: false,
                transaction_id: Some(&self.id),
            },
            result,
        )
    }

    pub async fn commit(mut self) -> DbResult<()> {
        let inner = self.take()?;
        inner
            .commit()
            .await
            .map_err(|e| DbError::transaction(format!("commit failed: {e}"), self.id.clone()))?;
        self.state = TransactionState::Committed;
        info!(database = %self.database, transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        let inner = self.take()?;
        inner
            .rollback()
            .await
            .map_err(|e| DbError::transaction(format!("rollback failed: {e}"), self.id.clone()))?;
        self.state = TransactionState::RolledBack;
        info!(database = %self.database, transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    fn take(&mut self) -> DbResult<Box<dyn DriverTransaction>> {
        self.inner
            .take()
            .ok_or_else(|| DbError::transaction("transaction already finished", self.id.clone()))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!(
                database = %self.database,
                transaction_id = %self.id,
                "Transaction dropped without commit or rollback; it will be rolled back"
            );
        }
    }
}
