//! Mobilib Cache - Tiered Read-Through Object Cache
//!
//! Memory map, persistent existence index and caller-supplied remote source,
//! coordinated per cached type by a single-flight cache master.
//! Shared errors, configuration and clocks live in mobilib-core.

pub mod cache;

pub use cache::{
    CacheHandle, CacheMaster, CacheMasterBuilder, CacheMetrics, CacheSource, CacheStats,
    CancelHandle, CompletionQueue, ExistenceIndex, Finisher, IdConverter, InMemoryExistenceIndex,
    IndexRecord, LmdbExistenceIndex, LmdbIndexError, MemCache, PendingCacheMaster, TaskId,
    TaskSerializer,
};

pub use mobilib_core::{CacheConfig, CacheError, CacheResult, IndexConfig, SourceError};
