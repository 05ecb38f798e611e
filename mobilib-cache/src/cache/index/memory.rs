//! In-memory existence index.
//!
//! Same contract as the LMDB backend without durability. Useful for tests
//! and for processes that only want coalescing and expiry bookkeeping.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use mobilib_core::{CacheResult, IndexError, Timestamp};

use super::{ExistenceIndex, IndexRecord};

/// `BTreeMap`-backed index. Keys are ordered so prefix deletes are range scans.
#[derive(Debug, Default)]
pub struct InMemoryExistenceIndex {
    records: RwLock<BTreeMap<String, Timestamp>>,
}

impl InMemoryExistenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExistenceIndex for InMemoryExistenceIndex {
    async fn upsert(&self, record: IndexRecord) -> CacheResult<()> {
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        records.insert(record.key, record.last_write);
        Ok(())
    }

    async fn upsert_many(&self, batch: Vec<IndexRecord>) -> CacheResult<()> {
        // Single write guard: readers see all of the batch or none of it.
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        for record in batch {
            records.insert(record.key, record.last_write);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<IndexRecord>> {
        let records = self.records.read().map_err(|_| IndexError::LockPoisoned)?;
        Ok(records.get(key).map(|ts| IndexRecord::new(key, *ts)))
    }

    async fn get_fresh(
        &self,
        keys: &[String],
        duration: Duration,
        now: Timestamp,
    ) -> CacheResult<Vec<IndexRecord>> {
        let records = self.records.read().map_err(|_| IndexError::LockPoisoned)?;
        Ok(keys
            .iter()
            .filter_map(|k| records.get(k).map(|ts| IndexRecord::new(k.as_str(), *ts)))
            .filter(|r| r.is_fresh(duration, now))
            .collect())
    }

    async fn get_all(&self) -> CacheResult<Vec<IndexRecord>> {
        let records = self.records.read().map_err(|_| IndexError::LockPoisoned)?;
        Ok(records
            .iter()
            .map(|(k, ts)| IndexRecord::new(k.as_str(), *ts))
            .collect())
    }

    async fn delete_by_key(&self, key: &str) -> CacheResult<bool> {
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        Ok(records.remove(key).is_some())
    }

    async fn delete_by_keys(&self, keys: &[String]) -> CacheResult<u64> {
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        Ok(keys.iter().filter(|k| records.remove(*k).is_some()).count() as u64)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        let doomed: Vec<String> = records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            records.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_all(&self) -> CacheResult<u64> {
        let mut records = self.records.write().map_err(|_| IndexError::LockPoisoned)?;
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilib_core::from_millis;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let index = InMemoryExistenceIndex::new();
        index.upsert(IndexRecord::new("u#1", from_millis(10))).await.unwrap();
        index.upsert(IndexRecord::new("u#1", from_millis(20))).await.unwrap();

        let record = index.get("u#1").await.unwrap().expect("record should exist");
        assert_eq!(record.last_write, from_millis(20));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_get_fresh_filters_without_deleting() {
        let index = InMemoryExistenceIndex::new();
        index
            .upsert_many(vec![
                IndexRecord::new("u#old", from_millis(1_000)),
                IndexRecord::new("u#new", from_millis(9_500)),
            ])
            .await
            .unwrap();

        let fresh = index
            .get_fresh(&keys(&["u#old", "u#new", "u#none"]), Duration::from_secs(1), from_millis(10_000))
            .await
            .unwrap();
        assert_eq!(fresh, vec![IndexRecord::new("u#new", from_millis(9_500))]);
        assert!(index.get("u#old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_by_prefix_spares_other_namespaces() {
        let index = InMemoryExistenceIndex::new();
        index
            .upsert_many(vec![
                IndexRecord::new("user#1", from_millis(1)),
                IndexRecord::new("user#2", from_millis(1)),
                IndexRecord::new("post#1", from_millis(1)),
                IndexRecord::new("users#1", from_millis(1)),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete_by_prefix("user#").await.unwrap(), 2);
        let remaining: Vec<String> = index.get_all().await.unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(remaining, keys(&["post#1", "users#1"]));
    }

    #[tokio::test]
    async fn test_deletes_report_counts() {
        let index = InMemoryExistenceIndex::new();
        index
            .upsert_many(vec![
                IndexRecord::new("a", from_millis(1)),
                IndexRecord::new("b", from_millis(1)),
                IndexRecord::new("c", from_millis(1)),
            ])
            .await
            .unwrap();

        assert!(index.delete_by_key("a").await.unwrap());
        assert!(!index.delete_by_key("a").await.unwrap());
        assert_eq!(index.delete_by_keys(&keys(&["b", "zz"])).await.unwrap(), 1);
        assert_eq!(index.delete_all().await.unwrap(), 1);
        assert!(index.is_empty());
    }
}
