mod common;

use std::time::Duration;

use bytes::Bytes;
use holo_coord::coord::{ErrorCode, LockMode, LockState};
use holo_lockd::protocol::Command;
use holo_lockd::remote_code;

use common::{session_with_handle, start_test_server, IO_TIMEOUT};

const LEASE: Duration = Duration::from_secs(30);
const SWEEP: Duration = Duration::from_millis(50);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_lock_is_handed_to_queued_waiter_on_release() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, _, handle) = session_with_handle(&server, "/locks/exclusive").await;
    let (b, sb, handle_b) = session_with_handle(&server, "/locks/exclusive").await;
    assert_eq!(handle, handle_b);

    assert_eq!(a.lock(handle, LockMode::Exclusive).await.unwrap(), 1);
    assert_eq!(b.try_lock(handle, LockMode::Exclusive).await.unwrap(), None);

    let waiter = tokio::spawn(async move {
        let generation = b.lock(handle, LockMode::Exclusive).await;
        (b, generation)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.coordinator().queue_len(handle), Some(1));
    assert!(!waiter.is_finished());

    a.release(handle).await.unwrap();
    let (b, generation) = tokio::time::timeout(IO_TIMEOUT, waiter)
        .await
        .expect("waiter granted")
        .unwrap();
    assert_eq!(generation.unwrap(), 2);
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Exclusive(sb))
    );
    b.release(handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_holders_coexist_and_show_up_in_stats() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, _, handle) = session_with_handle(&server, "/locks/shared").await;
    let (b, _, _) = session_with_handle(&server, "/locks/shared").await;

    a.lock(handle, LockMode::Shared).await.unwrap();
    b.lock(handle, LockMode::Shared).await.unwrap();
    assert_eq!(
        server.coordinator().lock_state(handle),
        Some(LockState::Shared(2))
    );

    let stats = a.stats().await.unwrap();
    assert_eq!(stats["sessions"], 2);
    assert_eq!(stats["grants"], 2);
    let handles = stats["handles"].as_array().unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0]["name"], "/locks/shared");
    assert_eq!(handles[0]["holders"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_errors_come_back_as_error_replies() {
    let server = start_test_server(LEASE, SWEEP);
    let (client, _, handle) = session_with_handle(&server, "/locks/errors").await;

    // Truncated lock payload: handle only, no mode or flag.
    let reply = client
        .call_raw(Command::LOCK, Bytes::copy_from_slice(&handle.to_le_bytes()))
        .await
        .unwrap();
    assert_eq!(reply.error_code(), Some(ErrorCode::Protocol));

    let reply = client.call_raw(0x7f, Bytes::new()).await.unwrap();
    assert_eq!(reply.error_code(), Some(ErrorCode::UnknownCommand));

    let err = client.release(handle).await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::NotLocked));
    let err = client.lock(handle + 100, LockMode::Shared).await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::UnknownHandle));

    // The connection is still usable after every error.
    client.keep_alive().await.unwrap();
    assert_eq!(client.lock(handle, LockMode::Exclusive).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_without_a_session_are_rejected() {
    let server = start_test_server(LEASE, SWEEP);
    let client = holo_lockd::LockClient::connect(server.addr()).await.unwrap();

    let err = client.open("/locks/nosession").await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::SessionExpired));

    // Stats does not need a session.
    let stats = client.stats().await.unwrap();
    assert_eq!(stats["sessions"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_the_session_releases_locks_for_others() {
    let server = start_test_server(LEASE, SWEEP);
    let (a, _, handle) = session_with_handle(&server, "/locks/close").await;
    let (b, _, _) = session_with_handle(&server, "/locks/close").await;

    a.lock(handle, LockMode::Exclusive).await.unwrap();
    let waiter = tokio::spawn(async move { b.lock(handle, LockMode::Shared).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.close_session().await.unwrap();
    let generation = tokio::time::timeout(IO_TIMEOUT, waiter)
        .await
        .expect("waiter granted")
        .unwrap()
        .unwrap();
    assert_eq!(generation, 1);
    assert_eq!(server.coordinator().session_count(), 1);
}
