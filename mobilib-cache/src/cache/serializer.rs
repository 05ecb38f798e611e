//! Single-flight FIFO task queue.
//!
//! A [`TaskSerializer`] runs at most one task at a time, in submission order.
//! A task is handed a [`Finisher`]; the next task does not start until that
//! finisher is released, either by [`Finisher::finish`] or by being dropped.
//! Dropping counts as finishing, so a task that returns early or panics
//! still releases the queue. Holding the finisher forever (leaking it, or
//! parking it somewhere nobody releases) stalls the serializer for good.
//!
//! Dispatch of the next task always goes through the runtime handle captured
//! at construction, never inline from `finish`, so a chain of tasks that
//! finish synchronously cannot grow the call stack.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Identity of a submitted task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Completion signal handed to a running task.
#[derive(Debug)]
pub struct Finisher {
    tx: Option<oneshot::Sender<()>>,
}

impl Finisher {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Release the serializer so the next queued task can start.
    pub fn finish(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

type BoxedTask = Box<dyn FnOnce(Finisher) -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    id: TaskId,
    task: BoxedTask,
}

#[derive(Default)]
struct SerializerState {
    queue: VecDeque<QueuedTask>,
    running: bool,
    next_id: u64,
}

struct SerializerInner {
    state: Mutex<SerializerState>,
    handle: Handle,
}

impl SerializerInner {
    fn lock(&self) -> MutexGuard<'_, SerializerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO, one-at-a-time task runner.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct TaskSerializer {
    inner: Arc<SerializerInner>,
}

impl TaskSerializer {
    /// Create a serializer bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, like [`Handle::current`].
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// Create a serializer whose tasks run on `handle`.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(SerializerInner {
                state: Mutex::new(SerializerState::default()),
                handle,
            }),
        }
    }

    /// Enqueue a task. It starts once every earlier task has finished.
    pub fn run<F, Fut>(&self, task: F) -> TaskId
    where
        F: FnOnce(Finisher) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedTask = Box::new(move |finisher| task(finisher).boxed());
        let mut state = self.inner.lock();
        let id = TaskId(state.next_id);
        state.next_id += 1;
        state.queue.push_back(QueuedTask { id, task: boxed });
        if !state.running {
            state.running = true;
            self.inner.handle.spawn(drive(Arc::clone(&self.inner)));
        }
        id
    }

    /// Enqueue a future; the serializer is released when it completes.
    pub fn run_future<Fut>(&self, fut: Fut) -> TaskId
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run(move |finisher| async move {
            fut.await;
            finisher.finish();
        })
    }

    /// Remove a task that has not started yet.
    ///
    /// Returns `false` if the task is already running, has completed, or was
    /// never submitted here.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        match state.queue.iter().position(|t| t.id == id) {
            Some(pos) => state.queue.remove(pos).is_some(),
            None => false,
        }
    }

    /// Drop every queued task. A running task is not interrupted.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    /// Whether a task currently holds the serializer.
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Number of queued tasks that have not started.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

/// Drain the queue one task at a time.
///
/// `running` is cleared under the same lock that observes the empty queue,
/// so a concurrent `run` either sees `running == true` and leaves its task
/// for this loop, or sees `false` and spawns a fresh driver.
async fn drive(inner: Arc<SerializerInner>) {
    loop {
        let next = {
            let mut state = inner.lock();
            match state.queue.pop_front() {
                Some(next) => next,
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        let (finisher, finished) = Finisher::new();
        inner.handle.spawn((next.task)(finisher));
        // Err means the finisher was dropped, which also releases the queue.
        let _ = finished.await;
    }
}
