//! Leasable pool of expensive-to-create resources.
//!
//! The pool creates resources through a caller-supplied [`ResourceFactory`],
//! leases them out as [`PoolGuard`]s, validates on borrow when configured,
//! hands returned resources directly to pending waiters, and evicts idle
//! resources on a background sweep. Demand beyond `max` queues FIFO with a
//! deadline.
//!
//! The pool must be created inside a tokio runtime; the idle sweeper is a
//! spawned task that stops when the pool is closed or dropped.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::waiter::{await_grant, late_grant, lock_state, WaitOutcome};

/// Creates, validates, and tears down pooled resources.
///
/// `validate` is consulted on borrow when `test_on_borrow` is set; an
/// invalid resource is destroyed silently and the acquire retries.
/// `destroy` is synchronous so leases can be returned from `Drop`; async
/// teardown belongs in the resource's own `Drop`.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self) -> Result<Self::Resource>;

    async fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }
}

/// Pool sizing and borrow-checking options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum resources alive at once (available + borrowed).
    pub max: usize,
    /// Floor the idle sweep and `drain` will not shrink below.
    pub min: usize,
    /// Available resources unused for longer than this are evicted. The
    /// sweep runs every `idle_timeout / 2`.
    pub idle_timeout: Duration,
    /// Deadline for a queued acquire; `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Run `ResourceFactory::validate` on every borrow.
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 10,
            min: 0,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Some(Duration::from_secs(30)),
            test_on_borrow: false,
        }
    }
}

impl PoolConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max.max(1);
        self
    }

    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Resources alive or being created.
    pub size: usize,
    pub available: usize,
    pub borrowed: usize,
    /// Callers queued for a lease.
    pub pending: usize,
    /// Lifetime created counter.
    pub created: u64,
    /// Lifetime destroyed counter.
    pub destroyed: u64,
}

struct IdleRecord<R> {
    resource: R,
    created_at: Instant,
    last_used: Instant,
}

impl<R> IdleRecord<R> {
    fn new(resource: R) -> Self {
        let now = Instant::now();
        Self {
            resource,
            created_at: now,
            last_used: now,
        }
    }
}

struct PoolWaiter<R> {
    id: u64,
    tx: oneshot::Sender<Result<IdleRecord<R>>>,
}

struct PoolState<R> {
    available: VecDeque<IdleRecord<R>>,
    borrowed: usize,
    creating: usize,
    waiters: VecDeque<PoolWaiter<R>>,
    created: u64,
    destroyed: u64,
    closed: bool,
}

impl<R> PoolState<R> {
    fn size(&self) -> usize {
        self.available.len() + self.borrowed + self.creating
    }
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: StdMutex<PoolState<F::Resource>>,
    next_id: AtomicU64,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

/// Resource pool. Cheap to clone; clones share the same pool.
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A leased resource. Dropping the guard returns the resource to the pool
/// (or destroys it if the pool closed while it was out).
pub struct PoolGuard<F: ResourceFactory> {
    record: Option<IdleRecord<F::Resource>>,
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Deref for PoolGuard<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self
            .record
            .as_ref()
            .expect("resource present until guard is consumed")
            .resource
    }
}

impl<F: ResourceFactory> DerefMut for PoolGuard<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .record
            .as_mut()
            .expect("resource present until guard is consumed")
            .resource
    }
}

impl<F: ResourceFactory> std::fmt::Debug for PoolGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> PoolGuard<F> {
    /// How long ago the factory created this resource.
    pub fn age(&self) -> Duration {
        self.record
            .as_ref()
            .map(|r| r.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Destroy the resource instead of returning it. Frees a capacity slot
    /// for queued acquirers.
    pub fn destroy(mut self) {
        if let Some(record) = self.record.take() {
            {
                let mut st = lock_state(&self.inner.state);
                st.borrowed -= 1;
                st.destroyed += 1;
            }
            self.inner.factory.destroy(record.resource);
            PoolInner::replenish_for_waiters(&self.inner);
        }
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.inner.release(record);
        }
    }
}

/// Cancel-safety bookkeeping for a queued acquire; a raced grant is
/// returned through the release path so the resource is not stranded.
struct PendingAcquire<'a, F: ResourceFactory> {
    inner: &'a Arc<PoolInner<F>>,
    id: u64,
    rx: oneshot::Receiver<Result<IdleRecord<F::Resource>>>,
    armed: bool,
}

impl<F: ResourceFactory> Drop for PendingAcquire<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.inner.remove_waiter(self.id) {
            if let Some(Ok(record)) = late_grant(&mut self.rx) {
                self.inner.release(record);
            }
        }
    }
}

impl<F: ResourceFactory> Pool<F> {
    /// Create a pool and start its idle sweeper.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            factory,
            config: config.clone(),
            state: StdMutex::new(PoolState {
                available: VecDeque::new(),
                borrowed: 0,
                creating: 0,
                waiters: VecDeque::new(),
                created: 0,
                destroyed: 0,
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            sweeper: StdMutex::new(None),
        });

        let weak: Weak<PoolInner<F>> = Arc::downgrade(&inner);
        let period = (config.idle_timeout / 2).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.sweep_idle() {
                    break;
                }
            }
        });
        *lock_state(&inner.sweeper) = Some(handle);

        Self { inner }
    }

    /// Lease a resource: reuse an idle one, create below `max`, else queue
    /// with the configured deadline.
    pub async fn acquire(&self) -> Result<PoolGuard<F>> {
        enum Plan<R> {
            Reuse(IdleRecord<R>),
            Create,
            Wait(u64, oneshot::Receiver<Result<IdleRecord<R>>>),
        }

        let deadline = self.inner.config.acquire_timeout;
        loop {
            let plan = {
                let mut st = lock_state(&self.inner.state);
                if st.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(record) = st.available.pop_front() {
                    st.borrowed += 1;
                    Plan::Reuse(record)
                } else if st.size() < self.inner.config.max {
                    st.creating += 1;
                    Plan::Create
                } else {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push_back(PoolWaiter { id, tx });
                    Plan::Wait(id, rx)
                }
            };

            match plan {
                Plan::Reuse(record) => {
                    let guard = self.guard(record);
                    if self.borrow_valid(&guard).await {
                        return Ok(guard);
                    }
                    // Invalid resource discarded; try again.
                    guard.destroy();
                    continue;
                }
                Plan::Create => {
                    match self.inner.factory.create().await {
                        Ok(resource) => {
                            let mut st = lock_state(&self.inner.state);
                            st.creating -= 1;
                            st.created += 1;
                            st.borrowed += 1;
                            drop(st);
                            return Ok(self.guard(IdleRecord::new(resource)));
                        }
                        Err(err) => {
                            let mut st = lock_state(&self.inner.state);
                            st.creating -= 1;
                            drop(st);
                            return Err(err);
                        }
                    }
                }
                Plan::Wait(id, rx) => {
                    let mut pending = PendingAcquire {
                        inner: &self.inner,
                        id,
                        rx,
                        armed: true,
                    };
                    match await_grant(&mut pending.rx, deadline).await {
                        WaitOutcome::Granted(Ok(record)) => {
                            pending.armed = false;
                            let guard = self.guard(record);
                            if self.borrow_valid(&guard).await {
                                return Ok(guard);
                            }
                            guard.destroy();
                            continue;
                        }
                        WaitOutcome::Granted(Err(err)) => {
                            pending.armed = false;
                            return Err(err);
                        }
                        WaitOutcome::Closed => {
                            pending.armed = false;
                            return Err(Error::PoolClosed);
                        }
                        WaitOutcome::TimedOut => {
                            pending.armed = false;
                            if !self.inner.remove_waiter(id) {
                                // Grant raced the deadline: the demand was
                                // met, so keep the resource.
                                if let Some(Ok(record)) = late_grant(&mut pending.rx) {
                                    let guard = self.guard(record);
                                    if self.borrow_valid(&guard).await {
                                        return Ok(guard);
                                    }
                                    guard.destroy();
                                    continue;
                                }
                            }
                            return Err(Error::AcquireTimeout {
                                resource: "pool",
                                waited: deadline.unwrap_or_default(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Lease a resource, run `f` on it, return it on every exit path.
    pub async fn with<T, Fun>(&self, f: Fun) -> Result<T>
    where
        Fun: for<'r> FnOnce(&'r mut F::Resource) -> BoxFuture<'r, T>,
    {
        let mut guard = self.acquire().await?;
        Ok(f(&mut guard).await)
    }

    /// Evict idle resources until the pool is down to `min`.
    pub fn drain(&self) {
        let victims = {
            let mut st = lock_state(&self.inner.state);
            let mut victims = Vec::new();
            while st.size() > self.inner.config.min {
                match st.available.pop_back() {
                    Some(record) => {
                        st.destroyed += 1;
                        victims.push(record);
                    }
                    None => break,
                }
            }
            victims
        };
        if !victims.is_empty() {
            tracing::debug!(evicted = victims.len(), "pool drained");
        }
        for record in victims {
            self.inner.factory.destroy(record.resource);
        }
    }

    /// Close the pool: reject queued acquires, destroy available resources,
    /// and destroy borrowed resources as their guards come back.
    pub fn close(&self) {
        let (waiters, victims, sweeper) = {
            let mut st = lock_state(&self.inner.state);
            if st.closed {
                return;
            }
            st.closed = true;
            let waiters = std::mem::take(&mut st.waiters);
            let victims: Vec<_> = st.available.drain(..).collect();
            st.destroyed += victims.len() as u64;
            let sweeper = lock_state(&self.inner.sweeper).take();
            (waiters, victims, sweeper)
        };
        tracing::info!(
            rejected_waiters = waiters.len(),
            destroyed = victims.len(),
            "pool closed"
        );
        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::PoolClosed));
        }
        for record in victims {
            self.inner.factory.destroy(record.resource);
        }
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        lock_state(&self.inner.state).closed
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStats {
        let st = lock_state(&self.inner.state);
        PoolStats {
            size: st.size(),
            available: st.available.len(),
            borrowed: st.borrowed,
            pending: st.waiters.len(),
            created: st.created,
            destroyed: st.destroyed,
        }
    }

    fn guard(&self, record: IdleRecord<F::Resource>) -> PoolGuard<F> {
        PoolGuard {
            record: Some(record),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run borrow validation when configured. The record is already inside
    /// its guard, so a caller cancelled mid-validation returns the resource
    /// through the guard's normal drop path instead of stranding it.
    async fn borrow_valid(&self, guard: &PoolGuard<F>) -> bool {
        if !self.inner.config.test_on_borrow {
            return true;
        }
        let ok = self.inner.factory.validate(guard).await;
        if !ok {
            tracing::debug!("discarding pooled resource that failed borrow validation");
        }
        ok
    }
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Return a lease: destroy if closed, hand directly to the earliest
    /// live waiter, else shelve as available.
    fn release(&self, mut record: IdleRecord<F::Resource>) {
        record.last_used = Instant::now();
        let mut st = lock_state(&self.state);
        if st.closed {
            st.borrowed -= 1;
            st.destroyed += 1;
            drop(st);
            self.factory.destroy(record.resource);
            return;
        }
        // Direct hand-off keeps the borrowed count: the lease transfers.
        while let Some(waiter) = st.waiters.pop_front() {
            match waiter.tx.send(Ok(record)) {
                Ok(()) => return,
                Err(returned) => match returned {
                    Ok(rec) => record = rec,
                    // Unreachable: we sent Ok.
                    Err(_) => return,
                },
            }
        }
        st.borrowed -= 1;
        st.available.push_back(record);
    }

    fn remove_waiter(&self, id: u64) -> bool {
        let mut st = lock_state(&self.state);
        match st.waiters.iter().position(|w| w.id == id) {
            Some(idx) => {
                st.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// After a destroy freed a capacity slot, create a replacement for
    /// queued waiters. Runs as a spawned task because creation is async and
    /// destroys can happen in `Drop`.
    fn replenish_for_waiters(inner: &Arc<Self>) {
        let need = {
            let mut st = lock_state(&inner.state);
            if !st.closed && !st.waiters.is_empty() && st.size() < inner.config.max {
                st.creating += 1;
                true
            } else {
                false
            }
        };
        if !need {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            match inner.factory.create().await {
                Ok(resource) => {
                    {
                        let mut st = lock_state(&inner.state);
                        st.creating -= 1;
                        st.created += 1;
                        st.borrowed += 1;
                    }
                    // Goes to the head waiter, or to the shelf if everyone
                    // left meanwhile.
                    inner.release(IdleRecord::new(resource));
                }
                Err(err) => {
                    let waiter = {
                        let mut st = lock_state(&inner.state);
                        st.creating -= 1;
                        st.waiters.pop_front()
                    };
                    if let Some(waiter) = waiter {
                        let _ = waiter.tx.send(Err(err));
                    }
                }
            }
        });
    }

    /// Evict available resources idle beyond `idle_timeout`, keeping at
    /// least `min`. Returns true when the pool is closed.
    fn sweep_idle(&self) -> bool {
        let victims = {
            let mut st = lock_state(&self.state);
            if st.closed {
                return true;
            }
            let mut victims = Vec::new();
            let mut index = 0;
            while index < st.available.len() {
                if st.size() <= self.config.min {
                    break;
                }
                let expired = st.available[index].last_used.elapsed() > self.config.idle_timeout;
                if expired {
                    if let Some(record) = st.available.remove(index) {
                        st.destroyed += 1;
                        victims.push(record);
                    }
                } else {
                    index += 1;
                }
            }
            victims
        };
        if !victims.is_empty() {
            tracing::debug!(evicted = victims.len(), "idle sweep evicted resources");
        }
        for record in victims {
            self.factory.destroy(record.resource);
        }
        false
    }
}

impl<F: ResourceFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("size", &stats.size)
            .field("available", &stats.available)
            .field("borrowed", &stats.borrowed)
            .field("pending", &stats.pending)
            .finish()
    }
}
