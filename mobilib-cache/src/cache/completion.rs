//! The designated completion context.
//!
//! Every `get` callback runs here, one at a time, in the order results were
//! produced. Callers therefore never see two callbacks of the same queue
//! running concurrently, regardless of which worker produced the result.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Sequential executor for completion callbacks.
///
/// Cheap to clone; clones feed the same consumer. The consumer task ends once
/// every clone has been dropped.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl CompletionQueue {
    /// Spawn the consumer on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(&Handle::current())
    }

    pub fn with_handle(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("completion callback panicked");
                }
            }
        });
        Self { tx }
    }

    /// Queue `job` behind every previously dispatched job.
    ///
    /// If the consumer is gone (runtime shut down) the job runs inline so
    /// that resources it owns, such as a serializer finisher, are released.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Box::new(job)) {
            tracing::warn!("completion queue closed, running callback inline");
            job();
        }
    }
}
