//! Per-instance counters for cache master activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by a cache master as requests move through the tiers.
///
/// Counts are per object id, not per request, except `failed_gets`.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Ids resolved from the memory map
    pub memory_hits: AtomicU64,

    /// Ids resolved from the caller's database after a fresh index hit
    pub database_hits: AtomicU64,

    /// Ids requested from the server
    pub server_fetches: AtomicU64,

    /// Server fetches that returned an error
    pub server_failures: AtomicU64,

    /// Ids served from the database after a server failure
    pub fallback_hits: AtomicU64,

    /// `get` requests that ended in an error
    pub failed_gets: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            database_hits: self.database_hits.load(Ordering::Relaxed),
            server_fetches: self.server_fetches.load(Ordering::Relaxed),
            server_failures: self.server_failures.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            failed_gets: self.failed_gets.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub database_hits: u64,
    pub server_fetches: u64,
    pub server_failures: u64,
    pub fallback_hits: u64,
    pub failed_gets: u64,
}

impl CacheStats {
    /// Share of resolved ids served locally (memory or fresh database rows).
    ///
    /// Returns `0.0` before any id has been looked up.
    pub fn hit_rate(&self) -> f64 {
        let local = self.memory_hits + self.database_hits;
        let total = local + self.server_fetches;
        if total == 0 {
            0.0
        } else {
            local as f64 / total as f64
        }
    }
}
