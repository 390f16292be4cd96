//! Asynchronous read-write lock with writer preference.
//!
//! Any number of readers may hold the lock together; a writer holds it
//! alone. New readers block as soon as a writer is active *or queued*, so a
//! steady stream of readers cannot starve a writer. Releasing the last
//! holder prefers the next queued writer; when no writer is queued, all
//! queued readers are admitted at once.

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

struct RwState {
    readers: usize,
    writer: bool,
    reader_waiters: VecDeque<Waiter>,
    writer_waiters: VecDeque<Waiter>,
}

/// Async read-write lock.
pub struct RwLock {
    state: StdMutex<RwState>,
    next_id: AtomicU64,
}

/// Shared (read) hold on the lock; dropping it releases one reader.
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
}

/// Exclusive (write) hold on the lock; dropping it releases the writer.
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// Cancel-safety bookkeeping for a queued read/write acquire; see the
/// equivalent struct in `mutex.rs`.
struct Pending<'a> {
    lock: &'a RwLock,
    id: u64,
    mode: Mode,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.lock.remove_waiter(self.id, self.mode) {
            if late_grant(&mut self.rx).is_some() {
                // The grant already made us a holder; undo it.
                match self.mode {
                    Mode::Read => self.lock.release_read(),
                    Mode::Write => self.lock.release_write(),
                }
            }
        }
    }
}

impl RwLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(RwState {
                readers: 0,
                writer: false,
                reader_waiters: VecDeque::new(),
                writer_waiters: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire a shared read hold.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_>> {
        self.acquire_inner(Mode::Read, None).await?;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire a shared read hold, bounded by a deadline.
    pub async fn read_timeout(&self, deadline: Duration) -> Result<RwLockReadGuard<'_>> {
        self.acquire_inner(Mode::Read, Some(deadline)).await?;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire the exclusive write hold.
    pub async fn write(&self) -> Result<RwLockWriteGuard<'_>> {
        self.acquire_inner(Mode::Write, None).await?;
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Acquire the exclusive write hold, bounded by a deadline.
    pub async fn write_timeout(&self, deadline: Duration) -> Result<RwLockWriteGuard<'_>> {
        self.acquire_inner(Mode::Write, Some(deadline)).await?;
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Take a read hold only if readers may proceed right now.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_>> {
        let mut st = lock_state(&self.state);
        if !st.writer && st.writer_waiters.is_empty() {
            st.readers += 1;
            Some(RwLockReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Take the write hold only if the lock is completely free.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_>> {
        let mut st = lock_state(&self.state);
        if !st.writer && st.readers == 0 {
            st.writer = true;
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire a read hold, run `f`, release on every exit path.
    pub async fn run_read<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.read().await?;
        Ok(f().await)
    }

    /// Acquire the write hold, run `f`, release on every exit path.
    pub async fn run_write<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.write().await?;
        Ok(f().await)
    }

    /// Whether a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        lock_state(&self.state).writer
    }

    /// Number of active readers.
    pub fn reader_count(&self) -> usize {
        lock_state(&self.state).readers
    }

    async fn acquire_inner(&self, mode: Mode, deadline: Option<Duration>) -> Result<()> {
        loop {
            let (id, rx) = {
                let mut st = lock_state(&self.state);
                match mode {
                    Mode::Read => {
                        // Writer preference: a queued writer blocks new
                        // readers even while other readers are active.
                        if !st.writer && st.writer_waiters.is_empty() {
                            st.readers += 1;
                            return Ok(());
                        }
                    }
                    Mode::Write => {
                        if !st.writer && st.readers == 0 {
                            st.writer = true;
                            return Ok(());
                        }
                    }
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let waiter = Waiter { id, tx };
                match mode {
                    Mode::Read => st.reader_waiters.push_back(waiter),
                    Mode::Write => st.writer_waiters.push_back(waiter),
                }
                (id, rx)
            };
            let mut pending = Pending {
                lock: self,
                id,
                mode,
                rx,
                armed: true,
            };
            match await_grant(&mut pending.rx, deadline).await {
                WaitOutcome::Granted(()) => {
                    // The grant already counted us as a holder.
                    pending.armed = false;
                    return Ok(());
                }
                WaitOutcome::TimedOut => {
                    drop(pending);
                    return Err(Error::AcquireTimeout {
                        resource: match mode {
                            Mode::Read => "rwlock (read)",
                            Mode::Write => "rwlock (write)",
                        },
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

    /// Remove a waiter by id; a removed writer may unblock queued readers.
    fn remove_waiter(&self, id: u64, mode: Mode) -> bool {
        let mut st = lock_state(&self.state);
        let queue = match mode {
            Mode::Read => &mut st.reader_waiters,
            Mode::Write => &mut st.writer_waiters,
        };
        let found = match queue.iter().position(|w| w.id == id) {
            Some(idx) => {
                queue.remove(idx);
                true
            }
            None => false,
        };
        if found && mode == Mode::Write {
            Self::dispatch(&mut st);
        }
        found
    }

    fn release_read(&self) {
        let mut st = lock_state(&self.state);
        st.readers = st.readers.saturating_sub(1);
        Self::dispatch(&mut st);
    }

    fn release_write(&self) {
        let mut st = lock_state(&self.state);
        st.writer = false;
        Self::dispatch(&mut st);
    }

    /// Grant whatever the current state allows: the next queued writer once
    /// the lock drains, else every queued reader when no writer is queued.
    /// Dead waiters are skipped and do not consume a grant.
    fn dispatch(st: &mut RwState) {
        if st.writer {
            return;
        }
        if st.readers == 0 {
            while let Some(w) = st.writer_waiters.pop_front() {
                if w.tx.send(()).is_ok() {
                    st.writer = true;
                    return;
                }
            }
        }
        if !st.writer_waiters.is_empty() {
            return;
        }
        while let Some(r) = st.reader_waiters.pop_front() {
            if r.tx.send(()).is_ok() {
                st.readers += 1;
            }
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock_state(&self.state);
        f.debug_struct("RwLock")
            .field("readers", &st.readers)
            .field("writer", &st.writer)
            .field("queued_readers", &st.reader_waiters.len())
            .field("queued_writers", &st.writer_waiters.len())
            .finish()
    }
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
