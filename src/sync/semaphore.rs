//! Counting semaphore with FIFO waiters and multi-permit requests.
//!
//! Permits are handed back by dropping the [`SemaphorePermit`] guard.
//! Release re-credits the pool (capped at the construction-time maximum)
//! and then satisfies queued requests greedily in FIFO order while enough
//! permits remain.

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
    permits: usize,
    tx: oneshot::Sender<()>,
}

struct SemState {
    permits: usize,
    waiters: VecDeque<Waiter>,
}

/// Async counting semaphore.
pub struct Semaphore {
    state: StdMutex<SemState>,
    max: usize,
    next_id: AtomicU64,
}

/// Holds `count` permits; dropping it returns them to the semaphore.
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
    count: usize,
}

impl SemaphorePermit<'_> {
    /// Number of permits held by this guard.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Cancel-safety bookkeeping for a queued acquire; see the equivalent
/// struct in `mutex.rs`.
struct Pending<'a> {
    sem: &'a Semaphore,
    id: u64,
    permits: usize,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.sem.remove_waiter(self.id) {
            if late_grant(&mut self.rx).is_some() {
                self.sem.release(self.permits);
            }
        }
    }
}

impl Semaphore {
    /// Create a semaphore with `max` permits, all initially available.
    pub fn new(max: usize) -> Self {
        Self {
            state: StdMutex::new(SemState {
                permits: max,
                waiters: VecDeque::new(),
            }),
            max,
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire `n` permits, waiting as long as it takes.
    ///
    /// Requests above the construction-time maximum are clamped to it, so
    /// an oversized request waits for every permit rather than forever;
    /// check [`SemaphorePermit::count`] for the granted amount.
    pub async fn acquire(&self, n: usize) -> Result<SemaphorePermit<'_>> {
        self.acquire_inner(n, None).await
    }

    /// Acquire `n` permits (clamped to the maximum, as in
    /// [`Semaphore::acquire`]), giving up with [`Error::AcquireTimeout`] if
    /// the deadline passes while still queued.
    pub async fn acquire_timeout(&self, n: usize, deadline: Duration) -> Result<SemaphorePermit<'_>> {
        self.acquire_inner(n, Some(deadline)).await
    }

    /// Take `n` permits only if they are available right now.
    pub fn try_acquire(&self, n: usize) -> Option<SemaphorePermit<'_>> {
        let mut st = lock_state(&self.state);
        if st.permits >= n {
            st.permits -= n;
            Some(SemaphorePermit { sem: self, count: n })
        } else {
            None
        }
    }

    /// Acquire one permit, run `f`, release on every exit path.
    pub async fn run_permitted<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire(1).await?;
        Ok(f().await)
    }

    /// Permits currently available for immediate grant.
    pub fn available_permits(&self) -> usize {
        lock_state(&self.state).permits
    }

    /// Permits currently held by callers. Always equals
    /// `max - available_permits()`.
    pub fn in_use(&self) -> usize {
        self.max - lock_state(&self.state).permits
    }

    /// The construction-time permit ceiling.
    pub fn max_permits(&self) -> usize {
        self.max
    }

    /// Number of callers queued for permits.
    pub fn waiting(&self) -> usize {
        lock_state(&self.state).waiters.len()
    }

    async fn acquire_inner(&self, n: usize, deadline: Option<Duration>) -> Result<SemaphorePermit<'_>> {
        let n = n.min(self.max);
        loop {
            let (id, rx) = {
                let mut st = lock_state(&self.state);
                if st.permits >= n {
                    st.permits -= n;
                    return Ok(SemaphorePermit { sem: self, count: n });
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(Waiter { id, permits: n, tx });
                (id, rx)
            };
            let mut pending = Pending {
                sem: self,
                id,
                permits: n,
                rx,
                armed: true,
            };
            match await_grant(&mut pending.rx, deadline).await {
                WaitOutcome::Granted(()) => {
                    // The grant already debited the permits.
                    pending.armed = false;
                    return Ok(SemaphorePermit { sem: self, count: n });
                }
                WaitOutcome::TimedOut => {
                    drop(pending);
                    return Err(Error::AcquireTimeout {
                        resource: "semaphore",
                        waited: deadline.unwrap_or_default(),
                    });
                }
                WaitOutcome::Closed => {
                    pending.armed = false;
                    continue;
                }
            }
        }
    }

    fn remove_waiter(&self, id: u64) -> bool {
        let mut st = lock_state(&self.state);
        let found = match st.waiters.iter().position(|w| w.id == id) {
            Some(idx) => {
                st.waiters.remove(idx);
                true
            }
            None => false,
        };
        if found {
            // A large request at the head may have been the only thing
            // holding back smaller ones behind it.
            Self::grant_waiters(&mut st);
        }
        found
    }

    fn release(&self, n: usize) {
        let mut st = lock_state(&self.state);
        st.permits = (st.permits + n).min(self.max);
        Self::grant_waiters(&mut st);
    }

    /// Satisfy queued requests strictly in FIFO order while permits last.
    /// A dead waiter's debit is refunded on the spot.
    fn grant_waiters(st: &mut SemState) {
        loop {
            let need = match st.waiters.front() {
                Some(front) => front.permits,
                None => return,
            };
            if st.permits < need {
                return;
            }
            if let Some(w) = st.waiters.pop_front() {
                st.permits -= w.permits;
                if w.tx.send(()).is_err() {
                    st.permits += w.permits;
                }
            }
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock_state(&self.state);
        f.debug_struct("Semaphore")
            .field("max", &self.max)
            .field("available", &st.permits)
            .field("waiting", &st.waiters.len())
            .finish()
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_and_release_accounting() {
        let sem = Semaphore::new(3);
        let p1 = sem.acquire(2).await.unwrap();
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.in_use(), 2);
        drop(p1);
        assert_eq!(sem.available_permits(), 3);
        assert_eq!(sem.in_use(), 0);
    }

    #[tokio::test]
    async fn test_in_use_plus_available_is_constant() {
        let sem = Arc::new(Semaphore::new(4));
        let mut permits = Vec::new();
        for n in [1usize, 2, 1] {
            permits.push(sem.acquire(n).await.unwrap());
            assert_eq!(sem.in_use() + sem.available_permits(), 4);
        }
        permits.clear();
        assert_eq!(sem.in_use() + sem.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_release_never_exceeds_max() {
        let sem = Semaphore::new(2);
        let permit = sem.acquire(1).await.unwrap();
        // Internal release is capped even if over-credited.
        sem.release(10);
        assert_eq!(sem.available_permits(), 2);
        drop(permit);
        assert_eq!(sem.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_fifo_grant_on_release() {
        let sem = Arc::new(Semaphore::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let held = sem.acquire(1).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire(1).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_multi_permit_request_waits_for_enough() {
        let sem = Arc::new(Semaphore::new(3));
        let p1 = sem.acquire(2).await.unwrap();

        let big = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                let _p = sem.acquire(3).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!big.is_finished());

        drop(p1);
        big.await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_head_unblocks_smaller_waiters() {
        let sem = Arc::new(Semaphore::new(2));
        let held = sem.acquire(2).await.unwrap();

        // Head wants more than will be free; it times out.
        let head = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.acquire_timeout(2, Duration::from_millis(30)).await.map(|p| p.count()) })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let small = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                let _p = sem.acquire_timeout(1, Duration::from_millis(500)).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Free one permit: not enough for the head, so nobody is granted yet.
        sem.release(1);

        assert!(head.await.unwrap().is_err());
        // With the oversized head gone, the single-permit waiter proceeds.
        small.await.unwrap();
        drop(held);
    }

    #[tokio::test]
    async fn test_try_acquire_exhaustion() {
        let sem = Semaphore::new(2);
        let _p1 = sem.try_acquire(1).unwrap();
        let _p2 = sem.try_acquire(1).unwrap();
        assert!(sem.try_acquire(1).is_none());
    }

    #[tokio::test]
    async fn test_oversized_request_clamped_to_max() {
        let sem = Semaphore::new(2);
        let permit = sem.acquire(5).await.unwrap();
        assert_eq!(permit.count(), 2);
        assert_eq!(sem.available_permits(), 0);
    }
}
