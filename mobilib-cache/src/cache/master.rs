//! Three-tier cache orchestrator.
//!
//! A [`CacheMaster`] resolves object ids through, in order:
//!
//! 1. the expiring memory map,
//! 2. the existence index plus the caller's database, for ids the index
//!    knows were cached within the expiration window,
//! 3. the server, writing fetched objects back through every tier.
//!
//! When the server fails and fallback is enabled, the caller's database is
//! consulted once more without the freshness filter (stale data beats none).
//!
//! Every public operation runs as one task on the instance's
//! [`TaskSerializer`], so `get`, `put`, `delete` and `clear` never interleave
//! on the same master and overlapping lookups never fetch the same ids twice
//! concurrently. `get` results are delivered on the [`CompletionQueue`];
//! the serializer is released only after the callback has run.
//!
//! # Example
//!
//! ```ignore
//! let master = CacheMaster::builder(source, index)
//!     .config(CacheConfig::new().with_fallback(true))
//!     .build()?;
//!
//! master.put(user.clone()).await?;
//! let users = master.get(["42", "43"]).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use mobilib_core::{CacheConfig, CacheError, CacheResult, Clock, SystemClock, Timestamp};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::completion::CompletionQueue;
use super::handle::{CacheHandle, CancelHandle};
use super::id_converter::IdConverter;
use super::index::{ExistenceIndex, IndexRecord};
use super::mem_cache::MemCache;
use super::serializer::TaskSerializer;
use super::source::CacheSource;
use super::stats::{CacheMetrics, CacheStats};

/// Drop repeated ids, keeping the first occurrence of each.
pub(crate) fn dedupe<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(Into::into)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn unresolved(ids: &[String], found: &HashMap<String, impl Sized>) -> Vec<String> {
    ids.iter().filter(|id| !found.contains_key(*id)).cloned().collect()
}

/// Results in request order. `ids` must be free of duplicates.
fn assemble<T>(ids: &[String], mut found: HashMap<String, T>) -> Vec<T> {
    ids.iter().filter_map(|id| found.remove(id)).collect()
}

struct MasterInner<T, S> {
    source: S,
    index: Arc<dyn ExistenceIndex>,
    memory: MemCache<T>,
    ids: IdConverter,
    serializer: TaskSerializer,
    completion: CompletionQueue,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
}

impl<T, S> MasterInner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    fn namespace(&self) -> &str {
        self.ids.prefix()
    }

    /// Database read whose failure counts as "no rows".
    async fn read_database(&self, ids: &[String], stage: &'static str) -> Vec<T> {
        if ids.is_empty() {
            return Vec::new();
        }
        match self.source.fetch_from_database(ids).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    namespace = %self.namespace(),
                    stage,
                    requested = ids.len(),
                    error = %e,
                    "Database fetch failed, treating as no rows"
                );
                Vec::new()
            }
        }
    }

    /// Walk the tiers for `ids` (deduplicated, non-empty).
    async fn resolve(&self, ids: &[String]) -> CacheResult<Vec<T>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut found: HashMap<String, T> = self.memory.get_many(ids).into_iter().collect();

        CacheMetrics::add(&self.metrics.memory_hits, found.len());
        tracing::debug!(
            namespace = %self.namespace(),
            requested = ids.len(),
            memory_hits = found.len(),
            "Memory tier consulted"
        );

        let mut missing = unresolved(ids, &found);
        if missing.is_empty() {
            return Ok(assemble(ids, found));
        }

        // Tier 2: only ids the index vouches for are read from the database.
        let now = self.clock.now();
        let fresh = self
            .index
            .get_fresh(&self.ids.to_combo_ids(&missing), self.config.duration, now)
            .await?;
        let written: HashMap<String, Timestamp> = fresh
            .into_iter()
            .filter_map(|r| self.ids.to_origin_id(&r.key).map(|id| (id, r.last_write)))
            .collect();

        if !written.is_empty() {
            let candidates: Vec<String> = missing
                .iter()
                .filter(|id| written.contains_key(*id))
                .cloned()
                .collect();
            let rows = self.read_database(&candidates, "index").await;

            let mut hits = 0usize;
            for object in rows {
                let id = self.source.object_id(&object);
                let Some(last_write) = written.get(&id) else {
                    continue;
                };
                if found.contains_key(&id) {
                    continue;
                }
                self.memory.put_at(id.clone(), object.clone(), *last_write);
                found.insert(id, object);
                hits += 1;
            }

            CacheMetrics::add(&self.metrics.database_hits, hits);
            tracing::debug!(
                namespace = %self.namespace(),
                fresh_in_index = candidates.len(),
                database_hits = hits,
                "Index tier consulted"
            );

            missing = unresolved(ids, &found);
            if missing.is_empty() {
                return Ok(assemble(ids, found));
            }
        }

        // Tier 3
        CacheMetrics::add(&self.metrics.server_fetches, missing.len());
        tracing::debug!(
            namespace = %self.namespace(),
            missing = missing.len(),
            "Fetching from server"
        );

        match self.source.fetch_from_server(&missing).await {
            Ok(objects) => {
                if !objects.is_empty() {
                    self.write_through(&objects).await?;
                    if let Err(e) = self.source.store_to_database(&objects).await {
                        tracing::warn!(
                            namespace = %self.namespace(),
                            objects = objects.len(),
                            error = %e,
                            "Storing server objects to database failed"
                        );
                    }
                }
                for object in objects {
                    let id = self.source.object_id(&object);
                    if wanted.contains(id.as_str()) {
                        found.entry(id).or_insert(object);
                    }
                }

                missing = unresolved(ids, &found);
                if missing.is_empty() {
                    Ok(assemble(ids, found))
                } else {
                    tracing::debug!(
                        namespace = %self.namespace(),
                        unresolved = missing.len(),
                        "Server returned a partial result"
                    );
                    Err(CacheError::Incomplete { missing })
                }
            }
            Err(e) => {
                CacheMetrics::add(&self.metrics.server_failures, 1);
                tracing::warn!(
                    namespace = %self.namespace(),
                    missing = missing.len(),
                    fallback = self.config.fallback_on_server_fail,
                    error = %e,
                    "Server fetch failed"
                );
                if !self.config.fallback_on_server_fail {
                    return Err(e.into());
                }

                // Stale read: no freshness filter and no write-back.
                let rows = self.read_database(&missing, "fallback").await;
                let mut hits = 0usize;
                for object in rows {
                    let id = self.source.object_id(&object);
                    if wanted.contains(id.as_str()) && !found.contains_key(&id) {
                        found.insert(id, object);
                        hits += 1;
                    }
                }
                CacheMetrics::add(&self.metrics.fallback_hits, hits);

                missing = unresolved(ids, &found);
                if missing.is_empty() {
                    tracing::debug!(
                        namespace = %self.namespace(),
                        fallback_hits = hits,
                        "Served stale rows after server failure"
                    );
                    Ok(assemble(ids, found))
                } else {
                    Err(CacheError::Incomplete { missing })
                }
            }
        }
    }

    /// One batched index upsert, then the memory map, stamped with a single `now`.
    ///
    /// Memory is only written once the index accepted the batch.
    async fn write_through(&self, objects: &[T]) -> CacheResult<()> {
        let now = self.clock.now();
        let ids: Vec<String> = objects.iter().map(|o| self.source.object_id(o)).collect();
        let records = ids
            .iter()
            .map(|id| IndexRecord::new(self.ids.to_combo_id(id), now))
            .collect();
        self.index.upsert_many(records).await?;

        for (id, object) in ids.into_iter().zip(objects) {
            self.memory.put_at(id, object.clone(), now);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> CacheResult<u64> {
        let removed = self.memory.remove_many(ids);
        let deleted = self.index.delete_by_keys(&self.ids.to_combo_ids(ids)).await?;
        tracing::debug!(
            namespace = %self.namespace(),
            requested = ids.len(),
            memory_removed = removed.len(),
            index_removed = deleted,
            "Evicted ids"
        );
        Ok(deleted)
    }

    async fn clear(&self) -> CacheResult<u64> {
        self.memory.clear();
        let deleted = self.index.delete_by_prefix(self.ids.prefix()).await?;
        tracing::debug!(
            namespace = %self.namespace(),
            index_removed = deleted,
            "Cleared cache"
        );
        Ok(deleted)
    }
}

/// Builder for [`CacheMaster`].
pub struct CacheMasterBuilder<T, S> {
    source: S,
    index: Arc<dyn ExistenceIndex>,
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    completion: Option<CompletionQueue>,
    handle: Option<Handle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> CacheMasterBuilder<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for expiry and index timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a completion queue between masters so that all of their
    /// callbacks run on one sequential context.
    pub fn completion(mut self, completion: CompletionQueue) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Runtime for serialized tasks. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Validate the configuration and assemble the master.
    ///
    /// Fails with [`CacheError::Shutdown`] when no runtime handle was given
    /// and none is current.
    pub fn build(self) -> CacheResult<CacheMaster<T, S>> {
        self.config.validate()?;

        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| CacheError::Shutdown)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let completion = self
            .completion
            .unwrap_or_else(|| CompletionQueue::with_handle(&handle));
        let ids = match &self.config.namespace {
            Some(namespace) => IdConverter::new(namespace)?,
            None => IdConverter::for_type::<T>(),
        };

        tracing::debug!(
            namespace = %ids.prefix(),
            duration_ms = self.config.duration.as_millis() as u64,
            fallback = self.config.fallback_on_server_fail,
            "Cache master created"
        );

        Ok(CacheMaster {
            inner: Arc::new(MasterInner {
                source: self.source,
                index: self.index,
                memory: MemCache::with_clock(self.config.duration, Arc::clone(&clock)),
                ids,
                serializer: TaskSerializer::with_handle(handle),
                completion,
                config: self.config,
                clock,
                metrics: CacheMetrics::new(),
            }),
        })
    }
}

/// Three-tier, single-flight object cache for one cached type.
///
/// Cheap to clone; clones share all state.
pub struct CacheMaster<T, S> {
    inner: Arc<MasterInner<T, S>>,
}

impl<T, S> Clone for CacheMaster<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> CacheMaster<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    pub fn builder(source: S, index: Arc<dyn ExistenceIndex>) -> CacheMasterBuilder<T, S> {
        CacheMasterBuilder {
            source,
            index,
            config: CacheConfig::default(),
            clock: None,
            completion: None,
            handle: None,
            _marker: PhantomData,
        }
    }

    /// Build with defaults on the current runtime.
    pub fn new(source: S, index: Arc<dyn ExistenceIndex>, config: CacheConfig) -> CacheResult<Self> {
        Self::builder(source, index).config(config).build()
    }

    /// Resolve `ids` and hand the result to `callback` on the completion queue.
    ///
    /// The result is all-or-nothing: either every distinct requested object,
    /// in request order, or an error. Repeated ids are looked up once.
    /// Cancelling before the request starts means `callback` never runs.
    pub fn get_with<I, Id, F>(&self, ids: I, callback: F) -> CancelHandle
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
        F: FnOnce(CacheResult<Vec<T>>) + Send + 'static,
    {
        let ids = dedupe(ids);
        if ids.is_empty() {
            self.inner.completion.dispatch(move || callback(Ok(Vec::new())));
            return CancelHandle::noop();
        }

        let inner = Arc::clone(&self.inner);
        let task = self.inner.serializer.run(move |finisher| async move {
            let result = inner.resolve(&ids).await;
            if result.is_err() {
                CacheMetrics::add(&inner.metrics.failed_gets, 1);
            }
            inner.completion.dispatch(move || {
                callback(result);
                finisher.finish();
            });
        });

        let serializer = self.inner.serializer.clone();
        CancelHandle::new(move || serializer.cancel(task))
    }

    /// Awaitable form of [`get_with`](Self::get_with).
    pub fn get<I, Id>(&self, ids: I) -> CacheHandle<Vec<T>>
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = self.get_with(ids, move |result| {
            let _ = tx.send(result);
        });
        CacheHandle::new(rx, cancel)
    }

    pub fn get_slice<Id: AsRef<str>>(&self, ids: &[Id]) -> CacheHandle<Vec<T>> {
        self.get(ids.iter().map(|id| id.as_ref().to_string()))
    }

    /// Single-object lookup. Fails with [`CacheError::NotFound`] when the
    /// wrapped list lookup comes back empty.
    pub fn get_one(&self, id: impl Into<String>) -> CacheHandle<T> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let cancel = self.get_with([id.clone()], move |result| {
            let one = result.and_then(|objects| {
                objects
                    .into_iter()
                    .next()
                    .ok_or(CacheError::NotFound { id })
            });
            let _ = tx.send(one);
        });
        CacheHandle::new(rx, cancel)
    }

    pub fn put(&self, object: T) -> CacheHandle<()> {
        self.put_many(vec![object])
    }

    /// Write objects through the memory map and the existence index.
    ///
    /// The caller's database is not written; `put` records that the caller
    /// already holds these objects locally.
    pub fn put_many(&self, objects: Vec<T>) -> CacheHandle<()> {
        if objects.is_empty() {
            return CacheHandle::ready(Ok(()));
        }
        self.submit(move |inner| async move {
            let count = objects.len();
            inner.write_through(&objects).await?;
            tracing::debug!(namespace = %inner.namespace(), objects = count, "Put objects");
            Ok(())
        })
    }

    /// Evict one id. Resolves to the number of index records removed.
    pub fn delete(&self, id: impl Into<String>) -> CacheHandle<u64> {
        self.delete_many([id])
    }

    /// Evict ids from the memory map and the existence index. The caller's
    /// database is untouched.
    pub fn delete_many<I, Id>(&self, ids: I) -> CacheHandle<u64>
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
    {
        let ids = dedupe(ids);
        if ids.is_empty() {
            return CacheHandle::ready(Ok(0));
        }
        self.submit(move |inner| async move { inner.delete(&ids).await })
    }

    /// Empty the memory map and drop this namespace from the existence index.
    /// Other namespaces sharing the index and the caller's database are untouched.
    pub fn clear(&self) -> CacheHandle<u64> {
        self.submit(|inner| async move { inner.clear().await })
    }

    /// Run a mutation on the serializer and report its result on a handle.
    fn submit<R, F, Fut>(&self, op: F) -> CacheHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(Arc<MasterInner<T, S>>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<R>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = self.inner.serializer.run(move |finisher| async move {
            let result = op(inner).await;
            let _ = tx.send(result);
            finisher.finish();
        });
        let serializer = self.inner.serializer.clone();
        CacheHandle::new(rx, CancelHandle::new(move || serializer.cancel(task)))
    }

    pub fn object_id(&self, object: &T) -> String {
        self.inner.source.object_id(object)
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn id_converter(&self) -> &IdConverter {
        &self.inner.ids
    }

    pub fn memory(&self) -> &MemCache<T> {
        &self.inner.memory
    }

    pub fn index(&self) -> &Arc<dyn ExistenceIndex> {
        &self.inner.index
    }

    pub fn completion(&self) -> &CompletionQueue {
        &self.inner.completion
    }

    /// Whether a task currently holds this master's serializer.
    pub fn is_busy(&self) -> bool {
        self.inner.serializer.is_running()
    }

    /// Queued operations that have not started.
    pub fn pending_tasks(&self) -> usize {
        self.inner.serializer.pending()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot()
    }
}
