//! Query-related data models.
//!
//! This module defines the result types returned by the execution entry points.

use super::value::{Record, Value};
use serde::Serialize;

/// Default page size cap for pagination.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 1000;

/// Outcome of a statement run through `exec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Backend-generated id, where the driver reports one (MySQL, SQLite)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_id,
        }
    }
}

/// Outcome of a structured write (`insert`, `save_upsert`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub rows_affected: u64,
    /// Key of the written row: caller-supplied or generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_key: Option<Value>,
}

/// One page of a paginated query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub records: Vec<Record>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

impl Page {
    /// Check if there is a page after this one.
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Statement cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_has_next() {
        let page = Page {
            records: Vec::new(),
            total: 25,
            page: 2,
            page_size: 10,
            total_pages: 3,
        };
        assert!(page.has_next());
        assert!(!Page { page: 3, ..page }.has_next());
    }

    #[test]
    fn test_hit_ratio() {
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
    }

    #[test]
    fn test_exec_result_serialization() {
        let json = serde_json::to_value(ExecResult::new(2, None)).unwrap();
        assert_eq!(json, serde_json::json!({ "rows_affected": 2 }));
    }
}
