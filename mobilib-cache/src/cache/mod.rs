//! Tiered object cache.
//!
//! Lookups go through three tiers in increasing cost order:
//!
//! | Tier | Component | Holds |
//! |---|---|---|
//! | 1 | [`MemCache`] | the objects, with an insertion time |
//! | 2 | [`ExistenceIndex`] + caller database | last write time per combo id; payload stays in the caller's database |
//! | 3 | caller server | the source of truth |
//!
//! [`CacheMaster`] wires the tiers together behind a [`TaskSerializer`], and
//! [`PendingCacheMaster`] batches near-simultaneous lookups into one.
//!
//! # Example
//!
//! ```ignore
//! let index = Arc::new(LmdbExistenceIndex::from_config(&config.index)?);
//! let users = PendingCacheMaster::new(CacheMaster::new(source, index, config.cache)?)?;
//!
//! // Two calls within one tick become one server fetch of {1, 2, 3}.
//! let (a, b) = tokio::join!(users.get(["1", "2"]), users.get(["2", "3"]));
//! ```

pub mod completion;
pub mod handle;
pub mod id_converter;
pub mod index;
pub mod master;
pub mod mem_cache;
pub mod pending;
pub mod serializer;
pub mod source;
pub mod stats;

pub use completion::CompletionQueue;
pub use handle::{CacheHandle, CancelHandle};
pub use id_converter::{IdConverter, SEPARATOR};
pub use index::{
    ExistenceIndex, InMemoryExistenceIndex, IndexRecord, LmdbExistenceIndex, LmdbIndexError,
};
pub use master::{CacheMaster, CacheMasterBuilder};
pub use mem_cache::MemCache;
pub use pending::PendingCacheMaster;
pub use serializer::{Finisher, TaskId, TaskSerializer};
pub use source::CacheSource;
pub use stats::{CacheMetrics, CacheStats};
