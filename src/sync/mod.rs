//! Lock primitives: mutex, read-write lock, counting semaphore.
//!
//! All three share the same machinery: state under one `std::sync::Mutex`
//! per instance, a FIFO waiter queue of oneshot senders, direct hand-off on
//! release, and per-waiter deadlines that remove the waiter without
//! disturbing the rest of the queue. Holds are RAII guards, so
//! release-on-all-exit-paths comes for free; the `run_*` helpers wrap the
//! acquire/run/release sequence for callers who prefer a closure.
//!
//! | Primitive | Admission rule |
//! |-----------|----------------|
//! | [`Mutex`] | one holder at a time |
//! | [`RwLock`] | many readers or one writer; queued writers block new readers |
//! | [`Semaphore`] | up to `max` permits out at once |

pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
