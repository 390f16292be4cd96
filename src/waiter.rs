//! Deferred-completion plumbing shared by every blocking primitive.
//!
//! A suspended caller is represented by an id-tagged [`oneshot::Sender`]
//! stored in the owning primitive's FIFO waiter queue. The caller awaits the
//! matching receiver, optionally bounded by a deadline. Settlement is
//! single-shot by construction; a second settle is impossible because the
//! sender is consumed.
//!
//! The timeout path is racy by nature: the grant may land in the channel in
//! the same instant the deadline fires. Callers resolve the race by removing
//! their id from the queue under the state lock and then draining the
//! channel with `try_recv`; a raced grant is recovered through the
//! primitive's normal release path.

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Lock a primitive's internal state, recovering from poisoning.
///
/// State mutations are short check-then-mutate sections that cannot leave
/// the state torn, so a poisoned lock is safe to re-enter.
pub(crate) fn lock_state<T>(state: &StdMutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of awaiting a grant with an optional deadline.
pub(crate) enum WaitOutcome<G> {
    /// The grant arrived.
    Granted(G),
    /// The deadline fired first. The caller still owns the receiver and
    /// must resolve the removal race against a late grant.
    TimedOut,
    /// The sender was dropped without settling (primitive closed or the
    /// waiter was discarded).
    Closed,
}

/// Await a grant on `rx`, bounded by `deadline` when present.
///
/// Takes the receiver by `&mut` so the caller can `try_recv` after a
/// timeout to detect a raced grant.
pub(crate) async fn await_grant<G>(
    rx: &mut oneshot::Receiver<G>,
    deadline: Option<Duration>,
) -> WaitOutcome<G> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, &mut *rx).await {
            Ok(Ok(grant)) => WaitOutcome::Granted(grant),
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => WaitOutcome::TimedOut,
        },
        None => match (&mut *rx).await {
            Ok(grant) => WaitOutcome::Granted(grant),
            Err(_) => WaitOutcome::Closed,
        },
    }
}

/// Drain a raced grant out of a timed-out receiver, if one landed.
pub(crate) fn late_grant<G>(rx: &mut oneshot::Receiver<G>) -> Option<G> {
    rx.try_recv().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_before_deadline() {
        let (tx, mut rx) = oneshot::channel();
        tx.send(7u32).unwrap();
        match await_grant(&mut rx, Some(Duration::from_millis(50))).await {
            WaitOutcome::Granted(v) => assert_eq!(v, 7),
            _ => panic!("expected grant"),
        }
    }

    #[tokio::test]
    async fn test_deadline_fires_then_late_grant_recoverable() {
        let (tx, mut rx) = oneshot::channel();
        match await_grant(&mut rx, Some(Duration::from_millis(10))).await {
            WaitOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
        // Grant lands after the deadline; it must still be drainable.
        tx.send(9u32).unwrap();
        assert_eq!(late_grant(&mut rx), Some(9));
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed() {
        let (tx, mut rx) = oneshot::channel::<u32>();
        drop(tx);
        match await_grant(&mut rx, None).await {
            WaitOutcome::Closed => {}
            _ => panic!("expected closed"),
        }
    }

    #[test]
    fn test_lock_state_recovers_from_poison() {
        let state = std::sync::Mutex::new(5u32);
        // Poison the lock on purpose.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = state.lock().unwrap();
            panic!("poison");
        }));
        assert_eq!(*lock_state(&state), 5);
    }
}
