mod common;

use std::time::{Duration, Instant};

use holo_coord::coord::{ErrorCode, LockEvent, LockMode, LockState, ReleaseReason};
use holo_lockd::{remote_code, LockClient};

use common::{session_with_handle, start_test_server, IO_TIMEOUT};

const LEASE: Duration = Duration::from_millis(400);
const SWEEP: Duration = Duration::from_millis(50);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_holder_expires_and_queued_waiter_is_granted() {
    let server = start_test_server(LEASE, SWEEP);
    let mut events = server.coordinator().subscribe();
    let (a, sa, handle) = session_with_handle(&server, "/locks/lease").await;
    let (b, sb, _) = session_with_handle(&server, "/locks/lease").await;

    a.lock(handle, LockMode::Exclusive).await.unwrap();
    let started = Instant::now();

    // B keeps its own lease alive while it waits; A goes silent.
    let wait = b.lock_with_timeout(handle, LockMode::Exclusive, IO_TIMEOUT);
    let heartbeat = async {
        loop {
            tokio::time::sleep(LEASE / 4).await;
            if b.keep_alive().await.is_err() {
                break;
            }
        }
    };
    let generation = tokio::select! {
        generation = wait => generation.unwrap(),
        _ = heartbeat => panic!("heartbeat stopped before the lock was granted"),
    };
    let waited = started.elapsed();

    assert_eq!(generation, 2);
    assert!(waited >= LEASE / 2, "granted too early: {waited:?}");
    assert!(waited < LEASE * 4, "granted too late: {waited:?}");
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Exclusive(sb))
    );

    let mut saw_forced_release = false;
    let mut saw_expiry = false;
    while let Ok(event) = events.try_recv() {
        match event {
            LockEvent::LockReleased {
                session,
                reason: ReleaseReason::SessionExpired,
                ..
            } if session == sa => saw_forced_release = true,
            LockEvent::SessionExpired { session, released } if session == sa => {
                assert_eq!(released, vec![handle]);
                saw_expiry = true;
            }
            _ => {}
        }
    }
    assert!(saw_forced_release && saw_expiry);

    let err = a.keep_alive().await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::SessionExpired));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_survives_reconnect_within_its_lease() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, sa, handle) = session_with_handle(&server, "/locks/reconnect").await;
    a.lock(handle, LockMode::Exclusive).await.unwrap();
    drop(a);

    let again = LockClient::connect(server.addr()).await.unwrap();
    again.attach_session(sa).await.unwrap();
    assert_eq!(again.session(), Some(sa));
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Exclusive(sa))
    );
    again.release(handle).await.unwrap();
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Unlocked)
    );

    // A lapsed session cannot be attached.
    drop(again);
    tokio::time::sleep(LEASE * 2).await;
    let late = LockClient::connect(server.addr()).await.unwrap();
    let err = late.attach_session(sa).await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::SessionExpired));
}
