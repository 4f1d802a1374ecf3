//! Background connection health monitor.
//!
//! One task per logical database pings the driver on an adaptive interval:
//! the normal interval while healthy, the shorter error interval after a
//! failure, until a ping succeeds again. The monitor only reports health; it
//! never blocks, cancels or retries user queries.

use crate::config::MonitorOptions;
use crate::db::driver::Driver;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
}

/// Snapshot of a monitor's view of its database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub state: HealthState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Interval until the next ping, in milliseconds
    pub interval_ms: u64,
    pub running: bool,
}

impl MonitorStatus {
    fn initial(interval: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
            interval_ms: interval.as_millis() as u64,
            running: true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// Status from a one-off check, for databases running without a monitor.
    pub fn from_check(result: Result<(), String>) -> Self {
        let failed = result.is_err();
        Self {
            state: if failed {
                HealthState::Degraded
            } else {
                HealthState::Healthy
            },
            consecutive_failures: u32::from(failed),
            last_check: Some(Utc::now()),
            last_error: result.err(),
            interval_ms: 0,
            running: false,
        }
    }
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct HealthMonitor {
    database: String,
    status: Arc<RwLock<MonitorStatus>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Spawn the monitor task. Must be called inside a tokio runtime.
    pub fn start(database: impl Into<String>, driver: Arc<dyn Driver>, options: MonitorOptions) -> Self {
        let database = database.into();
        let status = Arc::new(RwLock::new(MonitorStatus::initial(options.interval)));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            database.clone(),
            driver,
            options,
            Arc::clone(&status),
            shutdown_rx,
        ));
        info!(
            database = %database,
            interval_ms = options.interval.as_millis() as u64,
            error_interval_ms = options.error_interval.as_millis() as u64,
            "Health monitor started"
        );

        Self {
            database,
            status,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.status().is_healthy()
    }

    /// Signal the task and wait for it to finish. Safe to call more than once.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            warn!(database = %self.database, error = %e, "Health monitor task ended abnormally");
        }
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .running = false;
        info!(database = %self.database, "Health monitor stopped");
    }
}

async fn run(
    database: String,
    driver: Arc<dyn Driver>,
    options: MonitorOptions,
    status: Arc<RwLock<MonitorStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = options.interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let outcome = match tokio::time::timeout(options.ping_timeout, driver.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "ping timed out after {}ms",
                options.ping_timeout.as_millis()
            )),
        };

        let mut current = status.write().unwrap_or_else(PoisonError::into_inner);
        current.last_check = Some(Utc::now());
        match outcome {
            Ok(()) => {
                if current.state == HealthState::Degraded {
                    info!(
                        database = %database,
                        failures = current.consecutive_failures,
                        "Database connection recovered"
                    );
                } else {
                    debug!(database = %database, "Health check passed");
                }
                current.state = HealthState::Healthy;
                current.consecutive_failures = 0;
                current.last_error = None;
                interval = options.interval;
            }
            Err(error) => {
                if current.state == HealthState::Healthy {
                    warn!(database = %database, error = %error, "Database connection degraded");
                } else {
                    debug!(database = %database, error = %error, "Health check still failing");
                }
                current.state = HealthState::Degraded;
                current.consecutive_failures = current.consecutive_failures.saturating_add(1);
                current.last_error = Some(error);
                interval = options.error_interval;
            }
        }
        current.interval_ms = interval.as_millis() as u64;
    }
}
