//! Single logical dispatch loop for I/O and timer events.
//!
//! Connection drivers (see `net`) run on a tokio runtime owned by the reactor
//! and push readiness into one FIFO queue. `Reactor::run` drains that queue on
//! the calling thread, interleaving expired timers from the `TimerWheel`, so:
//! - events for one endpoint are handled in the order they were detected;
//! - timers are handled in deadline order relative to each other;
//! - a handler never runs concurrently with another handler.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;

use super::error::CoordError;
use super::timer::TimerWheel;
use super::types::{
    Clock, Connection, DispatchHandler, EndpointId, Event, MonotonicClock, ReactorConfig,
    TimerId,
};

enum Dispatch {
    Deliver(Event),
    /// Recompute the wait budget (new earliest timer or shutdown).
    Wake,
}

struct Endpoint {
    connection: Arc<dyn Connection>,
    handler: Arc<dyn DispatchHandler>,
}

struct Shared {
    tx: std_mpsc::Sender<Dispatch>,
    endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
    timers: Mutex<TimerWheel<Arc<dyn DispatchHandler>>>,
    next_endpoint: AtomicU64,
    shutdown: AtomicBool,
    clock: Arc<dyn Clock>,
    io: tokio::runtime::Handle,
}

/// Owner of the dispatch queue and the I/O runtime.
pub struct Reactor {
    shared: Arc<Shared>,
    rx: std_mpsc::Receiver<Dispatch>,
    runtime: tokio::runtime::Runtime,
    config: ReactorConfig,
}

/// Cloneable handle used by handlers, drivers and other threads.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: ReactorConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .context("build reactor io runtime")?;
        let (tx, rx) = std_mpsc::channel();
        let shared = Arc::new(Shared {
            tx,
            endpoints: RwLock::new(HashMap::new()),
            timers: Mutex::new(TimerWheel::new()),
            next_endpoint: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            clock,
            io: runtime.handle().clone(),
        });
        Ok(Self {
            shared,
            rx,
            runtime,
            config,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Process events until `ReactorHandle::shutdown` is called.
    ///
    /// Blocks the calling thread. On exit every remaining endpoint is closed
    /// and pending timers are dropped.
    pub fn run(self) -> anyhow::Result<()> {
        let handle = self.handle();
        let idle_wait = self.config.idle_wait.max(Duration::from_millis(1));
        tracing::info!(io_threads = self.config.io_threads, "reactor dispatch loop started");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            let now = self.shared.clock.now();
            self.fire_timers(&handle, now);

            let next_deadline = self.timers().next_deadline();
            let wait = next_deadline
                .map(|deadline| deadline.saturating_duration_since(self.shared.clock.now()))
                .unwrap_or(idle_wait)
                .min(idle_wait);

            match self.rx.recv_timeout(wait) {
                Ok(Dispatch::Deliver(event)) => self.dispatch(&handle, event),
                Ok(Dispatch::Wake) => {}
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let endpoints = {
            let mut guard = self
                .shared
                .endpoints
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for endpoint in endpoints.into_values() {
            endpoint.connection.close();
        }
        *self.timers() = TimerWheel::new();
        tracing::info!("reactor dispatch loop stopped");

        self.runtime.shutdown_timeout(Duration::from_millis(500));
        Ok(())
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, TimerWheel<Arc<dyn DispatchHandler>>> {
        self.shared
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fire_timers(&self, handle: &ReactorHandle, now: Instant) {
        // Pop under the lock, deliver outside it so handlers may reschedule.
        let fired = self.timers().pop_expired(now);
        for (timer_id, handler) in fired {
            invoke(handle, &handler, Event::Timer { timer_id });
        }
    }

    fn dispatch(&self, handle: &ReactorHandle, event: Event) {
        let (endpoint, terminal) = match &event {
            Event::Data { endpoint, .. } => (*endpoint, false),
            Event::StateChange { endpoint, state } => (*endpoint, state.is_terminal()),
            Event::Timer { timer_id } => {
                tracing::warn!(timer_id, "timer event arrived through the io queue; dropped");
                return;
            }
        };

        let handler = if terminal {
            // The endpoint is gone once the handler has seen its final state.
            self.shared
                .endpoints
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&endpoint)
                .map(|entry| entry.handler)
        } else {
            self.shared
                .endpoints
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&endpoint)
                .map(|entry| entry.handler.clone())
        };

        match handler {
            Some(handler) => invoke(handle, &handler, event),
            None => tracing::trace!(endpoint, "dropping event for deregistered endpoint"),
        }
    }
}

fn invoke(handle: &ReactorHandle, handler: &Arc<dyn DispatchHandler>, event: Event) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(handle, event)));
    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(panic = %message, "dispatch handler panicked; event dropped");
    }
}

impl ReactorHandle {
    /// Attach a connection; its events will be delivered to `handler`.
    pub fn register(
        &self,
        connection: Arc<dyn Connection>,
        handler: Arc<dyn DispatchHandler>,
    ) -> EndpointId {
        let endpoint = self.shared.next_endpoint.fetch_add(1, Ordering::Relaxed);
        self.shared
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                endpoint,
                Endpoint {
                    connection,
                    handler,
                },
            );
        endpoint
    }

    /// Stop delivering events for `endpoint` and close its connection.
    ///
    /// Events already queued for it are dropped.
    pub fn deregister(&self, endpoint: EndpointId) -> bool {
        let removed = self
            .shared
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&endpoint);
        match removed {
            Some(entry) => {
                entry.connection.close();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, endpoint: EndpointId) -> Option<Arc<dyn Connection>> {
        self.shared
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&endpoint)
            .map(|entry| entry.connection.clone())
    }

    pub fn send(&self, endpoint: EndpointId, frame: Bytes) -> Result<(), CoordError> {
        let connection = self
            .connection(endpoint)
            .ok_or(CoordError::ConnectionClosed)?;
        connection.send(frame)
    }

    pub fn endpoint_count(&self) -> usize {
        self.shared
            .endpoints
            .read()
            .map(|endpoints| endpoints.len())
            .unwrap_or(0)
    }

    /// Queue an I/O event for dispatch. Used by connection drivers.
    pub fn deliver(&self, event: Event) -> Result<(), CoordError> {
        if self.is_shutdown() {
            return Err(CoordError::Shutdown);
        }
        self.shared
            .tx
            .send(Dispatch::Deliver(event))
            .map_err(|_| CoordError::Shutdown)
    }

    pub fn schedule_at(&self, deadline: Instant, handler: Arc<dyn DispatchHandler>) -> TimerId {
        let (id, earliest) = {
            let mut timers = self
                .shared
                .timers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let earliest = timers
                .next_deadline()
                .map_or(true, |current| deadline < current);
            (timers.schedule(deadline, handler), earliest)
        };
        if earliest {
            let _ = self.shared.tx.send(Dispatch::Wake);
        }
        id
    }

    pub fn schedule_after(&self, delay: Duration, handler: Arc<dyn DispatchHandler>) -> TimerId {
        self.schedule_at(self.now() + delay, handler)
    }

    pub fn cancel_timer(&self, timer_id: TimerId) -> bool {
        self.shared
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel(timer_id)
    }

    pub fn pending_timers(&self) -> usize {
        self.shared
            .timers
            .lock()
            .map(|timers| timers.len())
            .unwrap_or(0)
    }

    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Runtime that drives connection I/O for this reactor.
    pub fn runtime_handle(&self) -> &tokio::runtime::Handle {
        &self.shared.io
    }

    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!("reactor shutdown requested");
        }
        let _ = self.shared.tx.send(Dispatch::Wake);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}
