//! End-to-end behavior of the task queue: concurrency limiting, priority
//! ordering, clearing, and quiescence notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowgate::{Error, QueueEvent, TaskOptions, TaskQueue};
use tokio_test::assert_pending;

#[tokio::test]
async fn test_handle_stays_pending_while_paused() {
    let queue = TaskQueue::new(1);
    queue.pause();
    let mut handle = tokio_test::task::spawn(queue.add(async { Ok(11) }));
    assert_pending!(handle.poll());

    queue.start();
    assert_eq!(handle.into_inner().await.unwrap(), 11);
}

#[tokio::test]
async fn test_concurrency_limit_stretches_wall_time() {
    // 4 tasks of ~40ms at concurrency 2 need two waves, so roughly 2x the
    // single-task duration. Generous bounds keep this stable under CI load.
    let queue = TaskQueue::new(2);
    let started = Instant::now();

    let handles = queue.add_all(
        (0..4).map(|_| async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(())
        }),
        0,
    );
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(75), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_priority_orders_backlog_while_paused() {
    let queue = TaskQueue::new(1);
    queue.pause();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (priority, label) in [(0, "low"), (10, "high"), (5, "mid")] {
        let order = Arc::clone(&order);
        handles.push(queue.add_with_priority(
            async move {
                order.lock().unwrap().push(label);
                Ok(())
            },
            priority,
        ));
    }

    queue.start();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn test_clear_settles_pending_handles() {
    let queue = TaskQueue::new(1);
    queue.pause();
    let h1 = queue.add(async { Ok(1) });
    let h2 = queue.add(async { Ok(2) });

    let removed = queue.clear();
    assert_eq!(removed, 2);
    assert!(matches!(h1.await, Err(Error::QueueCleared)));
    assert!(matches!(h2.await, Err(Error::QueueCleared)));

    // The queue keeps working after a clear.
    queue.start();
    assert_eq!(queue.add(async { Ok(3) }).await.unwrap(), 3);
}

#[tokio::test]
async fn test_per_task_timeout_frees_the_slot() {
    let queue = TaskQueue::new(1);
    let slow = queue.add_with_options(
        async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        },
        TaskOptions::new().with_timeout(Duration::from_millis(20)),
    );
    let quick = queue.add(async { Ok("after") });

    assert!(matches!(slow.await, Err(Error::TaskTimeout(_))));
    assert_eq!(quick.await.unwrap(), "after");
}

#[tokio::test]
async fn test_events_and_idle_notification() {
    let queue = TaskQueue::new(2);
    let completions = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&completions);
    queue.on(QueueEvent::TaskComplete, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let idle = queue.on_idle();
    let handles = queue.add_all((0..3).map(|_| async { Ok(()) }), 0);
    for handle in handles {
        handle.await.unwrap();
    }
    idle.await;

    assert_eq!(completions.load(Ordering::SeqCst), 3);
    assert!(queue.is_idle());
    let stats = queue.stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);
}
