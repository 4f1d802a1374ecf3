//! Short-lived cache of pagination totals.
//!
//! Entries are keyed by a fingerprint of the database name, the rendered COUNT
//! statement and its arguments, and expire after the TTL the caller passed to
//! `paginate`. Independent of the statement cache.

use crate::models::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Bound on entries. Expired ones are swept first, then the soonest to expire.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct CountEntry {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct CountCache {
    database: String,
    entries: Mutex<HashMap<String, CountEntry>>,
}

impl CountCache {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(&self, sql: &str, args: &[Value]) -> String {
        let args = serde_json::to_string(args).unwrap_or_default();
        format!("{}\u{1f}{}\u{1f}{}", self.database, sql, args)
    }

    /// Cached total for this COUNT statement, if present and fresh.
    pub fn get(&self, sql: &str, args: &[Value]) -> Option<u64> {
        let key = self.fingerprint(sql, args);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.count),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, sql: &str, args: &[Value], count: u64, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = self.fingerprint(sql, args);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= SWEEP_THRESHOLD && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= SWEEP_THRESHOLD {
                let mut by_expiry: Vec<(Instant, String)> = entries
                    .iter()
                    .map(|(key, entry)| (entry.expires_at, key.clone()))
                    .collect();
                by_expiry.sort_unstable();
                let excess = entries.len() + 1 - SWEEP_THRESHOLD + SWEEP_THRESHOLD / 8;
                for (_, key) in by_expiry.into_iter().take(excess) {
                    entries.remove(&key);
                }
            }
        }
        entries.insert(
            key,
            CountEntry {
                count,
                expires_at: now + ttl,
            },
        );
    }

    /// Number of entries, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_depends_on_args() {
        let cache = CountCache::new("main");
        let sql = "SELECT COUNT(*) FROM t WHERE a = ?";
        cache.insert(sql, &[Value::Int(1)], 25, Duration::from_secs(60));

        assert_eq!(cache.get(sql, &[Value::Int(1)]), Some(25));
        assert_eq!(cache.get(sql, &[Value::Int(2)]), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = CountCache::new("main");
        cache.insert("SELECT COUNT(*) FROM t", &[], 3, Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_live_entries_stay_bounded() {
        let cache = CountCache::new("main");
        let sql = "SELECT COUNT(*) FROM t WHERE a = ?";
        for i in 0..(SWEEP_THRESHOLD as i64 * 3) {
            cache.insert(sql, &[Value::Int(i)], i as u64, Duration::from_secs(3600));
        }
        assert!(cache.len() <= SWEEP_THRESHOLD);

        let last = SWEEP_THRESHOLD as i64 * 3 - 1;
        assert_eq!(cache.get(sql, &[Value::Int(last)]), Some(last as u64));
        assert_eq!(cache.get(sql, &[Value::Int(0)]), None);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = CountCache::new("main");
        cache.insert("SELECT COUNT(*) FROM t", &[], 3, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("SELECT COUNT(*) FROM t", &[]), None);
        assert!(cache.is_empty());
    }
}
