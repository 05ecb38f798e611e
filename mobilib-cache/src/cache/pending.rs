//! Request-coalescing decorator over [`CacheMaster`].
//!
//! `get` calls are parked for up to one batch interval. Each tick drains the
//! parked requests, issues a single underlying `get` for the union of their
//! ids, and fans the outcome back out: every request receives exactly its
//! own ids on success, or a clone of the shared error on failure.
//!
//! The ticker holds only a weak reference, so it stops on the first tick
//! after the last [`PendingCacheMaster`] clone is dropped.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use mobilib_core::{CacheError, CacheResult};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};

use super::handle::{CacheHandle, CancelHandle};
use super::master::{dedupe, CacheMaster};
use super::source::CacheSource;

type Deliver<T> = Box<dyn FnOnce(CacheResult<Vec<T>>) + Send>;

struct PendingRequest<T> {
    id: u64,
    ids: Vec<String>,
    deliver: Deliver<T>,
}

struct PendingQueue<T> {
    requests: Vec<PendingRequest<T>>,
    next_id: u64,
}

struct PendingInner<T, S> {
    master: CacheMaster<T, S>,
    queue: Mutex<PendingQueue<T>>,
}

impl<T, S> PendingInner<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    fn lock(&self) -> MutexGuard<'_, PendingQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) -> usize {
        let requests = mem::take(&mut self.lock().requests);
        if requests.is_empty() {
            return 0;
        }

        let union = dedupe(requests.iter().flat_map(|r| r.ids.iter().cloned()));
        let drained = requests.len();
        tracing::debug!(
            namespace = %self.master.id_converter().prefix(),
            requests = drained,
            ids = union.len(),
            "Flushing pending requests"
        );

        let master = self.master.clone();
        self.master.get_with(union, move |result| match result {
            Ok(objects) => {
                let by_id: HashMap<String, T> = objects
                    .into_iter()
                    .map(|o| (master.object_id(&o), o))
                    .collect();
                for request in requests {
                    let subset = request
                        .ids
                        .iter()
                        .filter_map(|id| by_id.get(id).cloned())
                        .collect();
                    (request.deliver)(Ok(subset));
                }
            }
            Err(e) => {
                for request in requests {
                    (request.deliver)(Err(e.clone()));
                }
            }
        });
        drained
    }
}

async fn run_ticker<T, S>(inner: Weak<PendingInner<T, S>>, period: Duration)
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            tracing::debug!("Pending cache master dropped, ticker stopped");
            break;
        };
        inner.flush();
    }
}

/// A [`CacheMaster`] whose lookups are batched per tick.
///
/// Mutations are forwarded to the wrapped master unchanged. Cheap to clone;
/// clones share the pending list.
pub struct PendingCacheMaster<T, S> {
    inner: Arc<PendingInner<T, S>>,
}

impl<T, S> Clone for PendingCacheMaster<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> PendingCacheMaster<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheSource<T>,
{
    /// Wrap `master`, ticking on the current runtime at the master's
    /// configured batch interval.
    pub fn new(master: CacheMaster<T, S>) -> CacheResult<Self> {
        let handle = Handle::try_current().map_err(|_| CacheError::Shutdown)?;
        Ok(Self::with_handle(master, &handle))
    }

    pub fn with_handle(master: CacheMaster<T, S>, handle: &Handle) -> Self {
        let period = master.config().batch_interval;
        let inner = Arc::new(PendingInner {
            master,
            queue: Mutex::new(PendingQueue {
                requests: Vec::new(),
                next_id: 0,
            }),
        });
        handle.spawn(run_ticker(Arc::downgrade(&inner), period));

        tracing::debug!(
            batch_interval_ms = period.as_millis() as u64,
            "Pending cache master started"
        );
        Self { inner }
    }

    /// Park a lookup until the next tick.
    ///
    /// Requests with no ids bypass batching. Cancelling removes the request
    /// if it has not been flushed yet; after that it has no effect.
    pub fn get_with<I, Id, F>(&self, ids: I, callback: F) -> CancelHandle
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
        F: FnOnce(CacheResult<Vec<T>>) + Send + 'static,
    {
        let ids = dedupe(ids);
        if ids.is_empty() {
            return self.inner.master.get_with(ids, callback);
        }

        let request_id = {
            let mut queue = self.inner.lock();
            let id = queue.next_id;
            queue.next_id += 1;
            queue.requests.push(PendingRequest {
                id,
                ids,
                deliver: Box::new(callback),
            });
            id
        };

        let weak = Arc::downgrade(&self.inner);
        CancelHandle::new(move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let mut queue = inner.lock();
            match queue.requests.iter().position(|r| r.id == request_id) {
                Some(pos) => {
                    queue.requests.remove(pos);
                    true
                }
                None => false,
            }
        })
    }

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

    /// Drain parked requests now instead of waiting for the tick.
    /// Returns how many requests were drained.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Requests parked for the next tick.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn put(&self, object: T) -> CacheHandle<()> {
        self.inner.master.put(object)
    }

    pub fn put_many(&self, objects: Vec<T>) -> CacheHandle<()> {
        self.inner.master.put_many(objects)
    }

    pub fn delete(&self, id: impl Into<String>) -> CacheHandle<u64> {
        self.inner.master.delete(id)
    }

    pub fn delete_many<I, Id>(&self, ids: I) -> CacheHandle<u64>
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
    {
        self.inner.master.delete_many(ids)
    }

    pub fn clear(&self) -> CacheHandle<u64> {
        self.inner.master.clear()
    }

    pub fn master(&self) -> &CacheMaster<T, S> {
        &self.inner.master
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::index::InMemoryExistenceIndex;
    use async_trait::async_trait;
    use mobilib_core::{CacheConfig, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String);

    #[derive(Default)]
    struct EchoSource {
        server_calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheSource<Item> for EchoSource {
        fn object_id(&self, object: &Item) -> String {
            object.0.clone()
        }

        async fn fetch_from_database(&self, _ids: &[String]) -> Result<Vec<Item>, SourceError> {
            Ok(Vec::new())
        }

        async fn store_to_database(&self, _objects: &[Item]) -> Result<(), SourceError> {
            Ok(())
        }

        async fn fetch_from_server(&self, ids: &[String]) -> Result<Vec<Item>, SourceError> {
            self.server_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ids.iter().cloned().map(Item).collect())
        }
    }

    /// Ticks far apart so tests drive flushing by hand.
    fn pending() -> PendingCacheMaster<Item, EchoSource> {
        let master = CacheMaster::builder(EchoSource::default(), Arc::new(InMemoryExistenceIndex::new()))
            .config(CacheConfig::new().with_batch_interval(Duration::from_secs(3600)))
            .build()
            .expect("valid config");
        PendingCacheMaster::new(master).expect("inside runtime")
    }

    #[tokio::test]
    async fn test_cancel_removes_parked_request() {
        let pending = pending();
        let handle = pending.get(["a"]);
        assert_eq!(pending.pending_requests(), 1);

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(pending.pending_requests(), 0);
        assert_eq!(pending.flush(), 0);
        assert_eq!(handle.await, Err(CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_flush_fans_out_subsets() {
        let pending = pending();
        let first = pending.get(["a", "b"]);
        let second = pending.get(["c", "b"]);

        assert_eq!(pending.flush(), 2);
        assert_eq!(first.await.unwrap(), vec![Item("a".into()), Item("b".into())]);
        assert_eq!(second.await.unwrap(), vec![Item("c".into()), Item("b".into())]);
        assert_eq!(pending.master().source().server_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_request_bypasses_batching() {
        let pending = pending();
        let handle = pending.get(Vec::<String>::new());
        assert_eq!(pending.pending_requests(), 0);
        assert_eq!(handle.await.unwrap(), Vec::<Item>::new());
    }
}
