mod common;

use std::time::Duration;

use holo_coord::coord::{CoordError, LockMode, LockState};
use rand::seq::SliceRandom;

use common::{session_with_handle, start_test_server};

const LEASE: Duration = Duration::from_secs(30);
const SWEEP: Duration = Duration::from_millis(50);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_timeout_is_distinct_from_try_lock_denial() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, sa, handle) = session_with_handle(&server, "/locks/timeout").await;
    let (b, _, _) = session_with_handle(&server, "/locks/timeout").await;

    a.lock(handle, LockMode::Exclusive).await.unwrap();

    assert_eq!(b.try_lock(handle, LockMode::Shared).await.unwrap(), None);

    let err = b
        .lock_with_timeout(handle, LockMode::Shared, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<CoordError>(), Some(&CoordError::Timeout));

    // The timed-out request was withdrawn, not left in the queue.
    assert_eq!(server.coordinator().queue_len(handle), Some(0));
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Exclusive(sa))
    );

    a.release(handle).await.unwrap();
    assert!(b.try_lock(handle, LockMode::Shared).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_are_granted_in_arrival_order() {
    let server = start_test_server(LEASE, SWEEP);
    let (holder, _, handle) = session_with_handle(&server, "/locks/order").await;
    holder.lock(handle, LockMode::Exclusive).await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..5 {
        let (client, session, _) = session_with_handle(&server, "/locks/order").await;
        clients.push((client, session));
    }
    // Arrival order is randomized; grants must follow it.
    clients.shuffle(&mut rand::thread_rng());
    let arrival: Vec<_> = clients.iter().map(|(_, session)| *session).collect();

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    for (client, session) in clients {
        let expected = server.coordinator().queue_len(handle).unwrap_or(0) + 1;
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            client.lock(handle, LockMode::Exclusive).await.unwrap();
            done_tx.send(session).unwrap();
            // Hold briefly so the next grant is observable in order.
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.release(handle).await.unwrap();
        });
        // Let each request reach the queue before the next one.
        while server.coordinator().queue_len(handle).unwrap_or(0) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    drop(done_tx);

    holder.release(handle).await.unwrap();
    let mut granted = Vec::new();
    while let Some(session) = done_rx.recv().await {
        granted.push(session);
    }
    assert_eq!(granted, arrival);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redundant_timed_lock_leaves_the_held_lock_in_place() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, sa, handle) = session_with_handle(&server, "/locks/redundant").await;
    a.lock(handle, LockMode::Exclusive).await.unwrap();

    // Either the AlreadyLocked reply or the deadline wins; neither may
    // release the lock taken above.
    for timeout in [Duration::ZERO, Duration::from_millis(1), Duration::from_millis(50)] {
        assert!(a
            .lock_with_timeout(handle, LockMode::Exclusive, timeout)
            .await
            .is_err());
        assert_eq!(
            server.coordinator().lock_state(handle),
            Some(LockState::Exclusive(sa))
        );
    }
}
