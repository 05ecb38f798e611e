//! Persistent existence index (tier 2 bookkeeping).
//!
//! The index maps a combo id to the time the object was last written to the
//! cache. It never holds the object itself: payload persistence belongs to
//! the caller's database. A record answers one question, "was this object
//! cached recently enough to trust the caller's local copy?".
//!
//! Backends must provide:
//! - replace-on-conflict upserts (last write wins, no merge),
//! - atomic batch upserts (all records written or none),
//! - a freshness-filtered multi-get that skips, but does not delete,
//!   expired records,
//! - prefix deletion, so one cached type can be cleared without touching
//!   other types sharing the store.

pub mod lmdb_backend;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use mobilib_core::{to_chrono, CacheResult, Timestamp};

pub use lmdb_backend::{LmdbExistenceIndex, LmdbIndexError};
pub use memory::InMemoryExistenceIndex;

/// One row of the existence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Combo id of the cached object.
    pub key: String,
    /// When the object was last written to the cache.
    pub last_write: Timestamp,
}

impl IndexRecord {
    pub fn new(key: impl Into<String>, last_write: Timestamp) -> Self {
        Self {
            key: key.into(),
            last_write,
        }
    }

    /// Fresh iff `now < last_write + duration`. A zero duration never expires.
    pub fn is_fresh(&self, duration: Duration, now: Timestamp) -> bool {
        if duration.is_zero() {
            return true;
        }
        match self.last_write.checked_add_signed(to_chrono(duration)) {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// Storage backend for the existence index.
///
/// Implementations must be thread-safe. Blocking backends should move their
/// I/O off the async worker threads.
#[async_trait]
pub trait ExistenceIndex: Send + Sync {
    /// Insert or replace one record.
    async fn upsert(&self, record: IndexRecord) -> CacheResult<()>;

    /// Insert or replace many records in a single atomic transaction.
    async fn upsert_many(&self, records: Vec<IndexRecord>) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<IndexRecord>>;

    /// Records for `keys` that are still fresh at `now` (see [`IndexRecord::is_fresh`]).
    ///
    /// Expired records are excluded from the result but stay stored.
    async fn get_fresh(
        &self,
        keys: &[String],
        duration: Duration,
        now: Timestamp,
    ) -> CacheResult<Vec<IndexRecord>>;

    /// Every stored record, fresh or not.
    async fn get_all(&self) -> CacheResult<Vec<IndexRecord>>;

    /// Returns whether a record was removed.
    async fn delete_by_key(&self, key: &str) -> CacheResult<bool>;

    /// Returns the number of records removed.
    async fn delete_by_keys(&self, keys: &[String]) -> CacheResult<u64>;

    /// Remove every record whose key starts with `prefix`.
    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<u64>;

    async fn delete_all(&self) -> CacheResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilib_core::from_millis;

    #[test]
    fn test_freshness_boundary() {
        let duration = Duration::from_millis(1_000);
        let now = from_millis(10_000);

        let expired = IndexRecord::new("k", from_millis(10_000 - 1_000 - 1));
        let exact = IndexRecord::new("k", from_millis(10_000 - 1_000));
        let fresh = IndexRecord::new("k", from_millis(10_000 - 1_000 + 1));

        assert!(!expired.is_fresh(duration, now));
        assert!(!exact.is_fresh(duration, now));
        assert!(fresh.is_fresh(duration, now));
    }

    #[test]
    fn test_zero_duration_is_always_fresh() {
        let record = IndexRecord::new("k", from_millis(0));
        assert!(record.is_fresh(Duration::ZERO, from_millis(4_000_000_000_000)));
    }
}
