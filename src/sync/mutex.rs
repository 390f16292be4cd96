//! Asynchronous FIFO mutex.
//!
//! Serializes access to a logical resource. Unlike `std::sync::Mutex` it
//! does not wrap data; callers hold a [`MutexGuard`] for the critical
//! section and release by dropping it. Release hands the lock directly to
//! the earliest queued waiter instead of re-opening a race.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::waiter::{await_grant, late_grant, lock_state, WaitOutcome};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct MutexState {
    held: bool,
    waiters: VecDeque<Waiter>,
}

/// Async mutual-exclusion lock with FIFO hand-off.
pub struct Mutex {
    state: StdMutex<MutexState>,
    next_id: AtomicU64,
}

/// Holds the mutex; dropping it releases the lock, handing it to the next
/// queued waiter if any.
pub struct MutexGuard<'a> {
    lock: &'a Mutex,
}

/// Cancel-safety bookkeeping for a queued acquire. If the acquire future is
/// dropped mid-wait, the waiter entry is removed; a grant that raced in is
/// pushed back through the release path so the lock cannot leak.
struct Pending<'a> {
    lock: &'a Mutex,
    id: u64,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.lock.remove_waiter(self.id) {
            // Already granted; give the lock back.
            if late_grant(&mut self.rx).is_some() {
                self.lock.unlock();
            }
        }
    }
}

impl Mutex {
    /// Create an unheld mutex.
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(MutexState {
                held: false,
                waiters: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire the lock, waiting as long as it takes.
    pub async fn acquire(&self) -> Result<MutexGuard<'_>> {
        self.acquire_inner(None).await
    }

    /// Acquire the lock, giving up with [`Error::AcquireTimeout`] if the
    /// deadline passes while still queued.
    pub async fn acquire_timeout(&self, deadline: Duration) -> Result<MutexGuard<'_>> {
        self.acquire_inner(Some(deadline)).await
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_>> {
        let mut st = lock_state(&self.state);
        if st.held {
            None
        } else {
            st.held = true;
            Some(MutexGuard { lock: self })
        }
    }

    /// Acquire, run `f`, release on every exit path.
    pub async fn run_exclusive<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await?;
        Ok(f().await)
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        lock_state(&self.state).held
    }

    /// Number of callers queued behind the current holder.
    pub fn waiting(&self) -> usize {
        lock_state(&self.state).waiters.len()
    }

    async fn acquire_inner(&self, deadline: Option<Duration>) -> Result<MutexGuard<'_>> {
        loop {
            let (id, rx) = {
                let mut st = lock_state(&self.state);
                if !st.held {
                    st.held = true;
                    return Ok(MutexGuard { lock: self });
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(Waiter { id, tx });
                (id, rx)
            };
            let mut pending = Pending {
                lock: self,
                id,
                rx,
                armed: true,
            };
            match await_grant(&mut pending.rx, deadline).await {
                WaitOutcome::Granted(()) => {
                    pending.armed = false;
                    // Hand-off keeps `held` set; the lock is ours.
                    return Ok(MutexGuard { lock: self });
                }
                WaitOutcome::TimedOut => {
                    // Pending::drop removes the entry and recovers a raced
                    // grant before we report the timeout.
                    drop(pending);
                    return Err(Error::AcquireTimeout {
                        resource: "mutex",
                        waited: deadline.unwrap_or_default(),
                    });
                }
                WaitOutcome::Closed => {
                    // The sender is only dropped when the entry is removed,
                    // which nothing but this caller does. Re-enqueue.
                    pending.armed = false;
                    continue;
                }
            }
        }
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

    fn unlock(&self) {
        let mut st = lock_state(&self.state);
        // Direct hand-off: `held` stays set for the new owner. Dead waiters
        // (receiver dropped) are skipped without disturbing the rest.
        while let Some(w) = st.waiters.pop_front() {
            if w.tx.send(()).is_ok() {
                return;
            }
        }
        st.held = false;
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock_state(&self.state);
        f.debug_struct("Mutex")
            .field("held", &st.held)
            .field("waiting", &st.waiters.len())
            .finish()
    }
}

impl std::fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
