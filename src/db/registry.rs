//! Registry of open databases.
//!
//! The registry is an explicitly owned value: callers create one and pass it
//! (usually behind an `Arc`) to whatever needs to look databases up by name.
//! Lookups share a read lock on the map. Opening a database (connect plus
//! ping) runs under a separate init mutex, so lookups of databases that are
//! already open never wait on a slow connect.

use crate::config::EngineOptions;
use crate::db::database::Database;
use crate::db::driver::Driver;
use crate::db::pool::SqlxDriver;
use crate::db::tracer::{LogTracer, QueryTracer};
use crate::error::{DbError, DbResult};
use crate::models::{CacheStats, ConnectionConfig, FeatureFlags};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug)]
pub struct DatabaseRegistry {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    init_lock: Mutex<()>,
    options: EngineOptions,
    tracer: Arc<dyn QueryTracer>,
}

impl DatabaseRegistry {
    /// Create a registry whose databases trace through [`LogTracer`].
    pub fn new(options: EngineOptions) -> Self {
        let tracer = Arc::new(LogTracer::new(options.slow_query_threshold));
        Self::with_tracer(options, tracer)
    }

    pub fn with_tracer(options: EngineOptions, tracer: Arc<dyn QueryTracer>) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            init_lock: Mutex::new(()),
            options,
            tracer,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Connect with the built-in driver and register the database under `config.id`.
    pub async fn open(&self, config: &ConnectionConfig) -> DbResult<Arc<Database>> {
        self.ensure_absent(&config.id).await?;
        let _init = self.init_lock.lock().await;
        // Re-check: another open may have finished while we waited for the lock.
        self.ensure_absent(&config.id).await?;

        let driver = SqlxDriver::connect(config, self.options.connect_timeout).await?;
        let server_version = driver.server_version().await;
        let db = self
            .install(&config.id, Arc::new(driver), config.features)
            .await?;
        info!(
            database = %config.id,
            dialect = %config.dialect,
            server_version = ?server_version,
            "Connected successfully"
        );
        Ok(db)
    }

    /// Register a caller-supplied driver, e.g. for Oracle or SQL Server.
    ///
    /// The driver is pinged before the database becomes visible.
    pub async fn register_driver(
        &self,
        name: &str,
        driver: Arc<dyn Driver>,
        features: FeatureFlags,
    ) -> DbResult<Arc<Database>> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DbError::invalid_input(format!(
                "invalid database name '{name}'"
            )));
        }
        self.ensure_absent(name).await?;
        let _init = self.init_lock.lock().await;
        self.ensure_absent(name).await?;

        let db = self.install(name, driver, features).await?;
        info!(database = %name, dialect = %db.dialect(), "Registered database driver");
        Ok(db)
    }

    async fn ensure_absent(&self, name: &str) -> DbResult<()> {
        if self.databases.read().await.contains_key(name) {
            return Err(DbError::already_registered(name));
        }
        Ok(())
    }

    /// Ping `driver`, wrap it and publish it. Caller holds the init lock.
    async fn install(
        &self,
        name: &str,
        driver: Arc<dyn Driver>,
        features: FeatureFlags,
    ) -> DbResult<Arc<Database>> {
        let ping = tokio::time::timeout(self.options.connect_timeout, driver.ping()).await;
        let ping = ping.unwrap_or_else(|_| {
            Err(DbError::timeout("initial ping", self.options.connect_timeout))
        });
        if let Err(e) = ping {
            driver.close().await;
            return Err(e);
        }

        let db = Arc::new(Database::new(
            name,
            driver,
            features,
            self.options,
            Arc::clone(&self.tracer),
        ));
        self.databases
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    /// Look up an open database.
    pub async fn lookup(&self, name: &str) -> DbResult<Arc<Database>> {
        self.databases
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::not_initialized(name))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.databases.read().await.contains_key(name)
    }

    /// Remove and close one database.
    pub async fn close(&self, name: &str) -> DbResult<()> {
        let db = self
            .databases
            .write()
            .await
            .remove(name)
            .ok_or_else(|| DbError::not_initialized(name))?;
        db.close().await;
        Ok(())
    }

    /// Remove and close every database.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<Database>)> =
            self.databases.write().await.drain().collect();
        for (name, db) in drained {
            info!(database = %name, "Closing database");
            db.close().await;
            if Arc::strong_count(&db) > 1 {
                warn!(database = %name, "Database closed while still referenced");
            }
        }
        info!("All databases closed");
    }

    /// Names of open databases, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Statement cache counters per database.
    pub async fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.databases
            .read()
            .await
            .iter()
            .map(|(name, db)| (name.clone(), db.cache_stats()))
            .collect()
    }
}
