//! Bounded-concurrency task queue with priorities and lifecycle events.
//!
//! Tasks are queued with an integer priority (higher runs sooner, FIFO
//! within equal priority) and run under a concurrency ceiling. Callers get
//! a [`TaskHandle`] that resolves to the task's result; the queue emits
//! typed [`QueueEvent`]s for observers.
//!
//! A per-task timeout converts a slow task into [`Error::TaskTimeout`]
//! without aborting the work: the underlying future keeps running detached
//! and its eventual result is discarded. This is deliberate best-effort
//! cancellation, not true cancellation.
//!
//! ```rust,no_run
//! use flowgate::queue::TaskQueue;
//!
//! # async fn demo() -> flowgate::Result<()> {
//! let queue = TaskQueue::new(2);
//! let handle = queue.add(async { Ok(21 * 2) });
//! assert_eq!(handle.await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod events;

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::waiter::lock_state;

pub use events::{ListenerId, QueueEvent, QueueNotice};
use events::{fire, Callback, Listeners};

/// Queue construction options.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum simultaneously running tasks.
    pub concurrency: usize,
    /// Default per-task timeout applied when a task does not set its own.
    pub task_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            task_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency ceiling.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the default per-task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

/// Per-task submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    pub priority: i32,
    pub timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher priority dispatches sooner.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the queue's default per-task timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    /// Total tasks ever added.
    pub total: u64,
}

/// Resolves to the task's result. Dropping the handle does not cancel the
/// task; the queue runs it regardless and discards the result.
pub struct TaskHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Queue-assigned task identifier, as seen in [`QueueNotice`].
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|settled| match settled {
            Ok(outcome) => outcome,
            // Sender gone without settling: the queue was dropped wholesale.
            Err(_) => Err(Error::QueueCleared),
        })
    }
}

/// Type-erased pending task: runnable once dispatched, rejectable while
/// still queued (`clear()`).
trait ErasedTask: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, err: Error);
}

struct TaskCell<T, Fut> {
    fut: Fut,
    tx: oneshot::Sender<Result<T>>,
    inner: Arc<Inner>,
    id: u64,
    timeout: Option<Duration>,
}

impl<T, Fut> ErasedTask for TaskCell<T, Fut>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let TaskCell {
            fut,
            tx,
            inner,
            id,
            timeout,
        } = *self;
        Box::pin(async move {
            inner.emit(QueueEvent::TaskStart, Some(id));

            // The user future runs in its own task so a timeout can free
            // the queue slot without aborting the work, and a panic is
            // contained as a join error.
            let mut join = tokio::spawn(fut);
            let outcome: Result<T> = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                    Ok(Ok(res)) => res,
                    Ok(Err(_)) => Err(Error::TaskPanicked),
                    Err(_) => {
                        tracing::debug!(
                            task = id,
                            timeout_ms = limit.as_millis() as u64,
                            "task timed out; underlying work continues, result discarded"
                        );
                        Err(Error::TaskTimeout(limit))
                    }
                },
                None => match (&mut join).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::TaskPanicked),
                },
            };

            let failed = outcome.is_err();
            {
                let mut st = lock_state(&inner.state);
                st.running -= 1;
                if failed {
                    st.failed += 1;
                } else {
                    st.completed += 1;
                }
            }
            inner.emit(
                if failed {
                    QueueEvent::TaskError
                } else {
                    QueueEvent::TaskComplete
                },
                Some(id),
            );
            let _ = tx.send(outcome);
            inner.dispatch();
            inner.notify_quiescence();
        })
    }

    fn reject(self: Box<Self>, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

struct PendingEntry {
    priority: i32,
    seq: u64,
    task: Box<dyn ErasedTask>,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, earlier sequence first inside a
        // priority class.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    pending: BinaryHeap<PendingEntry>,
    running: usize,
    paused: bool,
    concurrency: usize,
    next_seq: u64,
    completed: u64,
    failed: u64,
    total: u64,
    listeners: Listeners,
    idle_waiters: Vec<oneshot::Sender<()>>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

struct Inner {
    state: StdMutex<QueueState>,
    next_task_id: AtomicU64,
    default_timeout: Option<Duration>,
}

impl Inner {
    /// Start pending tasks while a slot is free. Concurrency changes are
    /// only observed here, never by preempting running tasks.
    fn dispatch(&self) {
        loop {
            let entry = {
                let mut st = lock_state(&self.state);
                if st.paused || st.running >= st.concurrency {
                    return;
                }
                match st.pending.pop() {
                    Some(entry) => {
                        st.running += 1;
                        entry
                    }
                    None => return,
                }
            };
            tokio::spawn(entry.task.run());
        }
    }

    fn emit(&self, event: QueueEvent, task_id: Option<u64>) {
        let callbacks: Vec<Callback> = {
            let st = lock_state(&self.state);
            st.listeners.snapshot(event)
        };
        fire(&callbacks, QueueNotice { event, task_id });
    }

    /// Fire `Idle` / `Drain` and settle their one-shot waiters when running
    /// drains to zero.
    fn notify_quiescence(&self) {
        let (event, waiters) = {
            let mut st = lock_state(&self.state);
            if st.running != 0 {
                return;
            }
            if st.pending.is_empty() {
                (QueueEvent::Idle, std::mem::take(&mut st.idle_waiters))
            } else {
                (QueueEvent::Drain, std::mem::take(&mut st.drain_waiters))
            }
        };
        self.emit(event, None);
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

/// Bounded-concurrency priority task queue. Cheap to clone; clones share
/// the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create a queue running at most `concurrency` tasks at once.
    pub fn new(concurrency: usize) -> Self {
        Self::with_config(QueueConfig::new().with_concurrency(concurrency))
    }

    /// Create a queue from a full config.
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(QueueState {
                    pending: BinaryHeap::new(),
                    running: 0,
                    paused: false,
                    concurrency: config.concurrency.max(1),
                    next_seq: 0,
                    completed: 0,
                    failed: 0,
                    total: 0,
                    listeners: Listeners::new(),
                    idle_waiters: Vec::new(),
                    drain_waiters: Vec::new(),
                }),
                next_task_id: AtomicU64::new(1),
                default_timeout: config.task_timeout,
            }),
        }
    }

    /// Add a task at priority 0.
    pub fn add<T, Fut>(&self, fut: Fut) -> TaskHandle<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.add_with_options(fut, TaskOptions::new())
    }

    /// Add a task with an explicit priority; higher runs sooner.
    pub fn add_with_priority<T, Fut>(&self, fut: Fut, priority: i32) -> TaskHandle<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.add_with_options(fut, TaskOptions::new().with_priority(priority))
    }

    /// Add a task with full per-task options.
    pub fn add_with_options<T, Fut>(&self, fut: Fut, options: TaskOptions) -> TaskHandle<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let cell = TaskCell {
            fut,
            tx,
            inner: Arc::clone(&self.inner),
            id,
            timeout: options.timeout.or(self.inner.default_timeout),
        };
        {
            let mut st = lock_state(&self.inner.state);
            let seq = st.next_seq;
            st.next_seq += 1;
            st.total += 1;
            st.pending.push(PendingEntry {
                priority: options.priority,
                seq,
                task: Box::new(cell),
            });
        }
        self.inner.dispatch();
        TaskHandle { id, rx }
    }

    /// Add a batch of same-typed tasks at one priority.
    pub fn add_all<T, Fut, I>(&self, tasks: I, priority: i32) -> Vec<TaskHandle<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        I: IntoIterator<Item = Fut>,
    {
        tasks
            .into_iter()
            .map(|fut| self.add_with_priority(fut, priority))
            .collect()
    }

    /// Stop dispatching new tasks. Running tasks are unaffected.
    pub fn pause(&self) {
        lock_state(&self.inner.state).paused = true;
    }

    /// Resume dispatching.
    pub fn start(&self) {
        lock_state(&self.inner.state).paused = false;
        self.inner.dispatch();
    }

    /// Whether dispatch is currently paused.
    pub fn is_paused(&self) -> bool {
        lock_state(&self.inner.state).paused
    }

    /// Reject every pending task with [`Error::QueueCleared`]. Running
    /// tasks finish normally. Returns the number of rejected tasks.
    pub fn clear(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut st = lock_state(&self.inner.state);
            std::mem::take(&mut st.pending).into_vec()
        };
        let count = entries.len();
        for entry in entries {
            entry.task.reject(Error::QueueCleared);
        }
        if count > 0 {
            tracing::debug!(cleared = count, "queue cleared");
        }
        self.inner.notify_quiescence();
        count
    }

    /// Change the concurrency ceiling. Takes effect on the next dispatch
    /// pass; running tasks are never preempted.
    pub fn set_concurrency(&self, concurrency: usize) {
        lock_state(&self.inner.state).concurrency = concurrency.max(1);
        self.inner.dispatch();
    }

    /// Current concurrency ceiling.
    pub fn concurrency(&self) -> usize {
        lock_state(&self.inner.state).concurrency
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> QueueStats {
        let st = lock_state(&self.inner.state);
        QueueStats {
            pending: st.pending.len(),
            running: st.running,
            completed: st.completed,
            failed: st.failed,
            total: st.total,
        }
    }

    /// True when nothing is pending or running.
    pub fn is_idle(&self) -> bool {
        let st = lock_state(&self.inner.state);
        st.pending.is_empty() && st.running == 0
    }

    /// Register an observer for one lifecycle event.
    pub fn on<F>(&self, event: QueueEvent, callback: F) -> ListenerId
    where
        F: Fn(QueueNotice) + Send + Sync + 'static,
    {
        lock_state(&self.inner.state)
            .listeners
            .add(event, Arc::new(callback))
    }

    /// Remove a previously registered observer.
    pub fn off(&self, listener: ListenerId) -> bool {
        lock_state(&self.inner.state).listeners.remove(listener)
    }

    /// Settles the *next* time the queue goes idle. Does not settle
    /// immediately for an already-idle queue; check [`TaskQueue::is_idle`]
    /// first.
    pub fn on_idle(&self) -> impl Future<Output = ()> {
        let (tx, rx) = oneshot::channel();
        lock_state(&self.inner.state).idle_waiters.push(tx);
        async move {
            let _ = rx.await;
        }
    }

    /// Settles the next time running drains to zero with tasks still
    /// pending (paused queue).
    pub fn on_drain(&self) -> impl Future<Output = ()> {
        let (tx, rx) = oneshot::channel();
        lock_state(&self.inner.state).drain_waiters.push(tx);
        async move {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("TaskQueue")
            .field("pending", &stats.pending)
            .field("running", &stats.running)
            .field("concurrency", &self.concurrency())
            .field("paused", &self.is_paused())
            .finish()
    }
}
