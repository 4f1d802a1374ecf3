//! Prepared statement cache.
//!
//! One cache per logical database, keyed by the final SQL text. Lookups of
//! distinct keys share a read lock; inserting a new slot (and evicting to make
//! room) happens under the write lock. Preparation itself runs outside the map
//! lock inside the slot's `OnceCell`, so concurrent callers asking for the same
//! statement wait for a single `Driver::prepare` call.

use crate::db::driver::{Driver, PreparedStatement};
use crate::error::DbResult;
use crate::models::CacheStats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

/// A cached statement and its access bookkeeping.
#[derive(Debug)]
pub struct CachedStatement {
    database: String,
    sql: String,
    handle: OnceCell<Arc<dyn PreparedStatement>>,
    created_at: Instant,
    /// Nanoseconds since the owning cache's epoch
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CachedStatement {
    fn new(database: &str, sql: &str, epoch: Instant) -> Self {
        let now = Instant::now();
        Self {
            database: database.to_string(),
            sql: sql.to_string(),
            handle: OnceCell::new(),
            created_at: now,
            last_access: AtomicU64::new(nanos_since(epoch, now)),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn touch(&self, epoch: Instant) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access
            .fetch_max(nanos_since(epoch, Instant::now()), Ordering::Relaxed);
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        !ttl.is_zero() && now.duration_since(self.created_at) >= ttl
    }

    /// Eviction score: idle time divided by use. Larger is less valuable.
    fn score(&self, epoch: Instant, now: Instant) -> f64 {
        let idle = nanos_since(epoch, now).saturating_sub(self.last_access.load(Ordering::Relaxed));
        idle as f64 / (self.access_count() + 1) as f64
    }
}

fn nanos_since(epoch: Instant, at: Instant) -> u64 {
    u64::try_from(at.saturating_duration_since(epoch).as_nanos()).unwrap_or(u64::MAX)
}

/// Bounded statement cache for one database.
#[derive(Debug)]
pub struct StatementCache {
    database: String,
    capacity: usize,
    ttl: Duration,
    epoch: Instant,
    entries: RwLock<HashMap<String, Arc<CachedStatement>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements for `ttl` each.
    ///
    /// A zero `ttl` disables expiry.
    pub fn new(database: impl Into<String>, capacity: usize, ttl: Duration) -> Self {
        Self {
            database: database.into(),
            capacity: capacity.max(1),
            ttl,
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Get the prepared handle for `sql`, preparing it through `driver` on a miss.
    ///
    /// Returns the handle and whether it came from the cache. Among concurrent
    /// callers for the same key, exactly one prepares and sees `false`.
    pub async fn get_or_prepare(
        &self,
        driver: &dyn Driver,
        sql: &str,
    ) -> DbResult<(Arc<dyn PreparedStatement>, bool)> {
        let slot = self.slot(sql);

        let prepared_here = AtomicBool::new(false);
        let flag = &prepared_here;
        let result = slot
            .handle
            .get_or_try_init(move || async move {
                flag.store(true, Ordering::Relaxed);
                driver.prepare(sql).await
            })
            .await;

        let handle = match result {
            Ok(handle) => Arc::clone(handle),
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.remove_slot(sql, &slot);
                return Err(e);
            }
        };

        slot.touch(self.epoch);
        let from_cache = !prepared_here.load(Ordering::Relaxed);
        if from_cache {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(database = %self.database, sql = %sql, "Prepared statement cached");
        }
        Ok((handle, from_cache))
    }

    /// Find or create the slot for `sql`.
    fn slot(&self, sql: &str) -> Arc<CachedStatement> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = entries.get(sql) {
                if !slot.is_expired(self.ttl, now) {
                    return Arc::clone(slot);
                }
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = entries.get(sql) {
            if !slot.is_expired(self.ttl, now) {
                return Arc::clone(slot);
            }
            debug!(database = %self.database, sql = %sql, "Statement cache entry expired");
            entries.remove(sql);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        if entries.len() >= self.capacity {
            self.evict(&mut entries, now);
        }
        let slot = Arc::new(CachedStatement::new(&self.database, sql, self.epoch));
        entries.insert(sql.to_string(), Arc::clone(&slot));
        slot
    }

    /// Drop expired entries, then the least valuable one if still full.
    fn evict(&self, entries: &mut HashMap<String, Arc<CachedStatement>>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, slot| !slot.is_expired(self.ttl, now));
        let mut evicted = before - entries.len();

        if entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .map(|(sql, slot)| (sql, slot.score(self.epoch, now)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(sql, _)| sql.clone());
            if let Some(sql) = victim {
                debug!(database = %self.database, sql = %sql, "Evicting cached statement");
                entries.remove(&sql);
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Remove `slot` if it is still the entry for `sql`.
    fn remove_slot(&self, sql: &str, slot: &Arc<CachedStatement>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(sql)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            entries.remove(sql);
        }
    }

    /// Drop the entry for `sql`. Returns whether one existed.
    pub fn invalidate(&self, sql: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sql)
            .is_some();
        if removed {
            debug!(database = %self.database, sql = %sql, "Invalidated cached statement");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }

    /// Access count of the entry for `sql`, if cached.
    pub fn access_count(&self, sql: &str) -> Option<u64> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sql)
            .map(|slot| slot.access_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::{DriverTransaction, PoolSettings};
    use crate::dialect::Dialect;
    use crate::error::DbError;
    use crate::models::{ExecResult, Record, Value};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Stmt(String);

    #[async_trait]
    impl PreparedStatement for Stmt {
        fn sql(&self) -> &str {
            &self.0
        }

        async fn query(&self, _args: &[Value]) -> DbResult<Vec<Record>> {
            Ok(Vec::new())
        }

        async fn exec(&self, _args: &[Value]) -> DbResult<ExecResult> {
            Ok(ExecResult::default())
        }
    }

    #[derive(Debug, Default)]
    struct CountingDriver {
        prepares: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn settings(&self) -> PoolSettings {
            PoolSettings::default()
        }

        async fn prepare(&self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(DbError::database("no such table", None, "check table"));
            }
            Ok(Arc::new(Stmt(sql.to_string())))
        }

        async fn query(&self, _sql: &str, _args: &[Value]) -> DbResult<Vec<Record>> {
            Ok(Vec::new())
        }

        async fn exec(&self, _sql: &str, _args: &[Value]) -> DbResult<ExecResult> {
            Ok(ExecResult::default())
        }

        async fn begin(&self) -> DbResult<Box<dyn DriverTransaction>> {
            Err(DbError::unsupported(Dialect::Sqlite, "transactions"))
        }

        async fn ping(&self) -> DbResult<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_hit_after_miss_and_invalidate() {
        let driver = CountingDriver::default();
        let cache = StatementCache::new("main", 8, Duration::from_secs(60));
        let sql = "SELECT * FROM t WHERE id = ?";

        let (_, cached) = cache.get_or_prepare(&driver, sql).await.unwrap();
        assert!(!cached);
        let (stmt, cached) = cache.get_or_prepare(&driver, sql).await.unwrap();
        assert!(cached);
        assert_eq!(stmt.sql(), sql);

        assert!(cache.invalidate(sql));
        assert!(!cache.invalidate(sql));
        let (_, cached) = cache.get_or_prepare(&driver, sql).await.unwrap();
        assert!(!cached);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 2, 1));
        assert_eq!(driver.prepares.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_prepare_is_not_cached() {
        let driver = CountingDriver::default();
        driver.fail.store(true, Ordering::SeqCst);
        let cache = StatementCache::new("main", 8, Duration::from_secs(60));

        assert!(cache.get_or_prepare(&driver, "SELECT 1").await.is_err());
        assert!(cache.is_empty());

        driver.fail.store(false, Ordering::SeqCst);
        let (_, cached) = cache.get_or_prepare(&driver, "SELECT 1").await.unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn test_evicts_least_valuable_entry() {
        let driver = CountingDriver::default();
        let cache = StatementCache::new("main", 2, Duration::ZERO);

        cache.get_or_prepare(&driver, "A").await.unwrap();
        for _ in 0..5 {
            cache.get_or_prepare(&driver, "A").await.unwrap();
        }
        cache.get_or_prepare(&driver, "B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get_or_prepare(&driver, "C").await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.access_count("A").is_some());
        assert!(cache.access_count("B").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_prepared_again() {
        let driver = CountingDriver::default();
        let cache = StatementCache::new("main", 4, Duration::from_millis(30));

        cache.get_or_prepare(&driver, "A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let (_, cached) = cache.get_or_prepare(&driver, "A").await.unwrap();
        assert!(!cached);
        assert_eq!(driver.prepares.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!((stats.evictions, stats.size), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_callers_prepare_once() {
        let driver = Arc::new(CountingDriver::default());
        let cache = Arc::new(StatementCache::new("main", 8, Duration::from_secs(60)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let driver = Arc::clone(&driver);
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_prepare(driver.as_ref(), "SELECT * FROM t WHERE a = ?")
                    .await
                    .map(|(_, cached)| cached)
            }));
        }

        let mut fresh = 0;
        for task in tasks {
            if !task.await.unwrap().unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(driver.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(cache.access_count("SELECT * FROM t WHERE a = ?"), Some(16));
    }
}
