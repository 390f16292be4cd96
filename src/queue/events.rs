//! Typed lifecycle events for the task queue.
//!
//! Observers register against a fixed event enum rather than a string name,
//! so a typo cannot silently register a dead listener. Callbacks are
//! best-effort: they run outside the queue's state lock and a panicking
//! callback is caught and discarded so it can never corrupt dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Queue lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    /// A task left the pending set and started running.
    TaskStart,
    /// A running task finished successfully.
    TaskComplete,
    /// A running task finished with an error (including timeout and panic).
    TaskError,
    /// Running and pending are both empty.
    Idle,
    /// Running drained to zero while tasks are still pending (queue paused
    /// or concurrency zero).
    Drain,
}

const EVENT_COUNT: usize = 5;

impl QueueEvent {
    fn slot(self) -> usize {
        match self {
            QueueEvent::TaskStart => 0,
            QueueEvent::TaskComplete => 1,
            QueueEvent::TaskError => 2,
            QueueEvent::Idle => 3,
            QueueEvent::Drain => 4,
        }
    }
}

/// Payload handed to event callbacks.
#[derive(Debug, Clone, Copy)]
pub struct QueueNotice {
    pub event: QueueEvent,
    /// Task the event concerns; `None` for `Idle` / `Drain`.
    pub task_id: Option<u64>,
}

/// Opaque token for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId {
    event: QueueEvent,
    id: u64,
}

pub(crate) type Callback = Arc<dyn Fn(QueueNotice) + Send + Sync>;

/// Per-event listener slots.
pub(crate) struct Listeners {
    next_id: u64,
    slots: [Vec<(u64, Callback)>; EVENT_COUNT],
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            slots: std::array::from_fn(|_| Vec::new()),
        }
    }

    pub(crate) fn add(&mut self, event: QueueEvent, cb: Callback) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots[event.slot()].push((id, cb));
        ListenerId { event, id }
    }

    pub(crate) fn remove(&mut self, listener: ListenerId) -> bool {
        let slot = &mut self.slots[listener.event.slot()];
        let before = slot.len();
        slot.retain(|(id, _)| *id != listener.id);
        slot.len() != before
    }

    /// Clone the callbacks for one event so they can be invoked after the
    /// state lock is released.
    pub(crate) fn snapshot(&self, event: QueueEvent) -> Vec<Callback> {
        self.slots[event.slot()]
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }
}

/// Invoke callbacks, swallowing panics. Observer failures are a documented
/// no-op: the queue's own state machine must never depend on them.
pub(crate) fn fire(callbacks: &[Callback], notice: QueueNotice) {
    for cb in callbacks {
        let _ = catch_unwind(AssertUnwindSafe(|| cb(notice)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_fire_remove() {
        let mut listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let id = listeners.add(
            QueueEvent::TaskStart,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        fire(
            &listeners.snapshot(QueueEvent::TaskStart),
            QueueNotice {
                event: QueueEvent::TaskStart,
                task_id: Some(1),
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        fire(
            &listeners.snapshot(QueueEvent::TaskStart),
            QueueNotice {
                event: QueueEvent::TaskStart,
                task_id: Some(2),
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_are_isolated_per_slot() {
        let mut listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        listeners.add(
            QueueEvent::Idle,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(listeners.snapshot(QueueEvent::Drain).is_empty());
        assert_eq!(listeners.snapshot(QueueEvent::Idle).len(), 1);
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let mut listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        listeners.add(QueueEvent::TaskError, Arc::new(|_| panic!("observer bug")));
        listeners.add(
            QueueEvent::TaskError,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        fire(
            &listeners.snapshot(QueueEvent::TaskError),
            QueueNotice {
                event: QueueEvent::TaskError,
                task_id: None,
            },
        );
        // The second callback still ran.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
