//! Lock server on top of `holo_coord`.
//!
//! `start_server` wires a `Reactor`, a `LockCoordinator` and the
//! connection-facing `LockService` together, listens on TCP and runs the
//! dispatch loop on its own thread. The same entry point backs the binary and
//! the integration tests.

pub mod client;
pub mod protocol;
pub mod service;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use holo_coord::coord::{CoordConfig, LockCoordinator, LockEvent, Reactor, ReactorConfig, ReactorHandle};
use tokio::sync::broadcast;

pub use client::{remote_code, LockClient, RemoteError};
pub use service::LockService;

/// CLI options for running the lock server.
#[derive(Parser, Debug, Clone)]
#[command(name = "holo-lockd")]
pub struct ServerArgs {
    /// Address for client connections.
    #[arg(long, env = "HOLO_LOCKD_LISTEN", default_value = "127.0.0.1:7400")]
    pub listen: SocketAddr,

    /// Session lease, renewed by any request from the session.
    #[arg(long, env = "HOLO_LOCKD_LEASE_TTL_MS", default_value_t = 20_000)]
    pub lease_ttl_ms: u64,

    /// How often lapsed sessions are reaped.
    #[arg(long, env = "HOLO_LOCKD_SWEEP_INTERVAL_MS", default_value_t = 500)]
    pub sweep_interval_ms: u64,

    /// Worker threads for connection I/O.
    #[arg(long, env = "HOLO_LOCKD_IO_THREADS", default_value_t = 2)]
    pub io_threads: usize,

    /// Buffered lock events per subscriber before it starts lagging.
    #[arg(long, env = "HOLO_LOCKD_EVENT_CAPACITY", default_value_t = 1024)]
    pub event_capacity: usize,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7400)),
            lease_ttl_ms: 20_000,
            sweep_interval_ms: 500,
            io_threads: 2,
            event_capacity: 1024,
        }
    }
}

impl ServerArgs {
    pub fn coord_config(&self) -> CoordConfig {
        CoordConfig {
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            event_capacity: self.event_capacity,
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            io_threads: self.io_threads,
            thread_name: "holo-lockd-io".to_string(),
            ..ReactorConfig::default()
        }
    }
}

/// Running server; shuts down on `shutdown` or drop.
pub struct ServerHandle {
    addr: SocketAddr,
    reactor: ReactorHandle,
    coordinator: Arc<LockCoordinator>,
    dispatch: Option<JoinHandle<anyhow::Result<()>>>,
}

impl ServerHandle {
    /// Bound listen address (resolves port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Stop the dispatch loop and wait for it to exit.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.reactor.shutdown();
        match self.dispatch.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("lock server dispatch thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = ?err, "lock server shutdown failed");
        }
    }
}

/// Start the lock server described by `args`.
pub fn start_server(args: &ServerArgs) -> anyhow::Result<ServerHandle> {
    let reactor = Reactor::new(args.reactor_config()).context("create reactor")?;
    let handle = reactor.handle();
    let coordinator = Arc::new(LockCoordinator::new(args.coord_config()));
    let service = LockService::new(coordinator.clone());

    // The reactor owns its runtime, so it is moved to its thread before any
    // fallible step: an error below must not drop it on the caller's thread.
    let dispatch = std::thread::Builder::new()
        .name("holo-lockd-dispatch".to_string())
        .spawn(move || reactor.run())
        .context("spawn dispatch thread")?;
    let mut server = ServerHandle {
        addr: args.listen,
        reactor: handle.clone(),
        coordinator: coordinator.clone(),
        dispatch: Some(dispatch),
    };

    server.addr = handle
        .listen_tcp(args.listen, service.clone())
        .with_context(|| format!("listen on {}", args.listen))?;
    service.start(&handle);
    handle
        .runtime_handle()
        .spawn(log_lock_events(coordinator.subscribe()));

    tracing::info!(
        listen = %server.addr,
        lease_ttl_ms = args.lease_ttl_ms,
        sweep_interval_ms = args.sweep_interval_ms,
        "lock server started"
    );
    Ok(server)
}

async fn log_lock_events(mut events: broadcast::Receiver<LockEvent>) {
    loop {
        match events.recv().await {
            Ok(LockEvent::SessionExpired { session, released }) => {
                tracing::info!(session, released = ?released, "session expired");
            }
            Ok(event) => tracing::trace!(?event, "lock event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "lock event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
