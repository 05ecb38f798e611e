//! LMDB-backed existence index.
//!
//! Uses the heed crate (Rust bindings for LMDB) as the durable store.
//!
//! # Record Layout
//!
//! - key: the combo id as UTF-8 bytes
//! - value: last write time as 8 little-endian bytes of epoch milliseconds
//!
//! LMDB keeps keys sorted, which doubles as the lookup index on `key` and
//! turns prefix deletes into a range scan.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Every operation runs on Tokio's blocking
//! pool inside one transaction:
//! - read transactions for `get`, `get_fresh` and `get_all`
//! - a single write transaction per `upsert_many` and per delete call, so a
//!   batch is either fully committed or not visible at all

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use mobilib_core::{from_millis, to_millis, CacheResult, IndexConfig, IndexError, Timestamp};

use super::{ExistenceIndex, IndexRecord};

/// Error type for LMDB index operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbIndexError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored value is not an 8-byte timestamp or a key is not UTF-8.
    #[error("Corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbIndexError to the shared IndexError.
impl From<LmdbIndexError> for IndexError {
    fn from(e: LmdbIndexError) -> Self {
        match e {
            LmdbIndexError::EnvOpen(reason) | LmdbIndexError::DbOpen(reason) => {
                IndexError::Open { reason }
            }
            LmdbIndexError::Io(io) => IndexError::Open {
                reason: io.to_string(),
            },
            LmdbIndexError::Transaction(reason) => IndexError::Transaction { reason },
            LmdbIndexError::Corrupted { key, reason } => IndexError::Corrupted { key, reason },
        }
    }
}

impl From<LmdbIndexError> for mobilib_core::CacheError {
    fn from(e: LmdbIndexError) -> Self {
        mobilib_core::CacheError::Index(e.into())
    }
}

fn txn_err(e: heed::Error) -> LmdbIndexError {
    LmdbIndexError::Transaction(e.to_string())
}

fn encode_value(ts: Timestamp) -> [u8; 8] {
    to_millis(ts).to_le_bytes()
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<IndexRecord, LmdbIndexError> {
    let key = std::str::from_utf8(key).map_err(|e| LmdbIndexError::Corrupted {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })?;
    let millis: [u8; 8] = value.try_into().map_err(|_| LmdbIndexError::Corrupted {
        key: key.to_string(),
        reason: format!("expected 8 timestamp bytes, found {}", value.len()),
    })?;
    Ok(IndexRecord::new(key, from_millis(i64::from_le_bytes(millis))))
}

/// LMDB-backed existence index.
///
/// Cheap to clone; clones share the environment.
///
/// # Example
///
/// ```ignore
/// use mobilib_cache::cache::index::{ExistenceIndex, IndexRecord, LmdbExistenceIndex};
///
/// let index = LmdbExistenceIndex::open("/tmp/mobilib-index", 16)?;
/// index.upsert(IndexRecord::new("app::User#42", Utc::now())).await?;
/// ```
#[derive(Clone)]
pub struct LmdbExistenceIndex {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
}

impl LmdbExistenceIndex {
    /// Open or create an index under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The map size in bytes does not fit in `usize`
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbIndexError> {
        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbIndexError::EnvOpen(format!("map size of {max_size_mb} MB overflows")))?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process;
        // callers share it through `Clone` rather than reopening it.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbIndexError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbIndexError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), max_size_mb, "Existence index opened");
        Ok(Self { env, db })
    }

    pub fn from_config(config: &IndexConfig) -> Result<Self, LmdbIndexError> {
        Self::open(&config.path, config.max_size_mb)
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<u64, LmdbIndexError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.db.len(&rtxn).map_err(txn_err)
    }

    pub fn is_empty(&self) -> Result<bool, LmdbIndexError> {
        Ok(self.len()? == 0)
    }

    /// Run `f` on the blocking pool with a clone of this handle.
    async fn blocking<R, F>(&self, f: F) -> CacheResult<R>
    where
        R: Send + 'static,
        F: FnOnce(LmdbExistenceIndex) -> Result<R, LmdbIndexError> + Send + 'static,
    {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || f(this)).await {
            Ok(result) => result.map_err(Into::into),
            Err(e) => Err(IndexError::TaskJoin {
                reason: e.to_string(),
            }
            .into()),
        }
    }

    fn read_record(&self, rtxn: &RoTxn<'_>, key: &str) -> Result<Option<IndexRecord>, LmdbIndexError> {
        match self.db.get(rtxn, key.as_bytes()).map_err(txn_err)? {
            Some(value) => decode_record(key.as_bytes(), value).map(Some),
            None => Ok(None),
        }
    }

    fn put_all(&self, records: &[IndexRecord]) -> Result<(), LmdbIndexError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for record in records {
            self.db
                .put(&mut wtxn, record.key.as_bytes(), &encode_value(record.last_write))
                .map_err(txn_err)?;
        }
        // Dropping an uncommitted transaction aborts it, so an early return
        // above leaves nothing behind.
        wtxn.commit().map_err(txn_err)
    }

    /// Collect keys matching `prefix` and delete them in one write transaction.
    fn remove_prefix(&self, prefix: &[u8]) -> Result<u64, LmdbIndexError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut doomed = Vec::new();
        for entry in self.db.prefix_iter(&wtxn, prefix).map_err(txn_err)? {
            let (key, _) = entry.map_err(txn_err)?;
            doomed.push(key.to_vec());
        }

        let mut deleted = 0u64;
        for key in &doomed {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }
}

#[async_trait]
impl ExistenceIndex for LmdbExistenceIndex {
    async fn upsert(&self, record: IndexRecord) -> CacheResult<()> {
        self.blocking(move |this| this.put_all(std::slice::from_ref(&record)))
            .await
    }

    async fn upsert_many(&self, records: Vec<IndexRecord>) -> CacheResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.blocking(move |this| this.put_all(&records)).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<IndexRecord>> {
        let key = key.to_string();
        self.blocking(move |this| {
            let rtxn = this.env.read_txn().map_err(txn_err)?;
            this.read_record(&rtxn, &key)
        })
        .await
    }

    async fn get_fresh(
        &self,
        keys: &[String],
        duration: Duration,
        now: Timestamp,
    ) -> CacheResult<Vec<IndexRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.to_vec();
        self.blocking(move |this| {
            let rtxn = this.env.read_txn().map_err(txn_err)?;
            let mut fresh = Vec::new();
            for key in &keys {
                if let Some(record) = this.read_record(&rtxn, key)? {
                    if record.is_fresh(duration, now) {
                        fresh.push(record);
                    }
                }
            }
            Ok(fresh)
        })
        .await
    }

    async fn get_all(&self) -> CacheResult<Vec<IndexRecord>> {
        self.blocking(|this| {
            let rtxn = this.env.read_txn().map_err(txn_err)?;
            let mut all = Vec::new();
            for entry in this.db.iter(&rtxn).map_err(txn_err)? {
                let (key, value) = entry.map_err(txn_err)?;
                all.push(decode_record(key, value)?);
            }
            Ok(all)
        })
        .await
    }

    async fn delete_by_key(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_string();
        self.blocking(move |this| {
            let mut wtxn = this.env.write_txn().map_err(txn_err)?;
            let deleted = this.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
            wtxn.commit().map_err(txn_err)?;
            Ok(deleted)
        })
        .await
    }

    async fn delete_by_keys(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.blocking(move |this| {
            let mut wtxn = this.env.write_txn().map_err(txn_err)?;
            let mut deleted = 0u64;
            for key in &keys {
                if this.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)? {
                    deleted += 1;
                }
            }
            wtxn.commit().map_err(txn_err)?;
            Ok(deleted)
        })
        .await
    }

    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let prefix = prefix.as_bytes().to_vec();
        self.blocking(move |this| this.remove_prefix(&prefix)).await
    }

    async fn delete_all(&self) -> CacheResult<u64> {
        self.blocking(|this| {
            let mut wtxn = this.env.write_txn().map_err(txn_err)?;
            let removed = this.db.len(&wtxn).map_err(txn_err)?;
            this.db.clear(&mut wtxn).map_err(txn_err)?;
            wtxn.commit().map_err(txn_err)?;
            Ok(removed)
        })
        .await
    }
}
