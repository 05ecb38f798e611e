//! Handles returned by cache operations.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use mobilib_core::{CacheError, CacheResult};
use tokio::sync::oneshot;

type CancelFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cancels a request that has not started executing yet.
///
/// Once the request is running, or has finished, cancelling is a no-op and
/// returns `false`.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancel: Option<CancelFn>,
}

impl CancelHandle {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Arc::new(cancel)),
        }
    }

    /// A handle with nothing to cancel, for requests completed up front.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Returns whether the request was removed before it started.
    pub fn cancel(&self) -> bool {
        self.cancel.as_ref().is_some_and(|cancel| cancel())
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Awaitable result of a cache operation.
///
/// Dropping the handle does not cancel the operation; it only discards the
/// result. A cancelled request resolves to [`CacheError::Cancelled`].
#[must_use = "await the handle to observe the result, or call `detach`"]
pub struct CacheHandle<R> {
    rx: oneshot::Receiver<CacheResult<R>>,
    cancel: CancelHandle,
}

impl<R> CacheHandle<R> {
    pub(crate) fn new(rx: oneshot::Receiver<CacheResult<R>>, cancel: CancelHandle) -> Self {
        Self { rx, cancel }
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(result: CacheResult<R>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, CancelHandle::noop())
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Detached cancellation token, usable after the handle is awaited elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Let the operation run to completion without observing it.
    pub fn detach(self) {}
}

impl<R> Future for CacheHandle<R> {
    type Output = CacheResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CacheError::Cancelled)))
    }
}

impl<R> fmt::Debug for CacheHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("cancel", &self.cancel)
            .finish()
    }
}
