//! Shared helpers for lock server integration tests.

#![allow(dead_code)]

use std::time::Duration;

use holo_coord::coord::{HandleId, SessionId};
use holo_lockd::{start_server, LockClient, ServerArgs, ServerHandle};

/// Upper bound for any single wait in these tests.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Start a server on an ephemeral port.
pub fn start_test_server(lease_ttl: Duration, sweep_interval: Duration) -> ServerHandle {
    init_tracing();
    let args = ServerArgs {
        listen: "127.0.0.1:0".parse().unwrap(),
        lease_ttl_ms: lease_ttl.as_millis() as u64,
        sweep_interval_ms: sweep_interval.as_millis() as u64,
        io_threads: 1,
        ..ServerArgs::default()
    };
    start_server(&args).expect("start lock server")
}

/// Connect, open a session and open `name`.
pub async fn session_with_handle(
    server: &ServerHandle,
    name: &str,
) -> (LockClient, SessionId, HandleId) {
    let client = LockClient::connect(server.addr()).await.expect("connect");
    let grant = client.open_session().await.expect("open session");
    let handle = client.open(name).await.expect("open handle");
    (client, grant.session, handle)
}
