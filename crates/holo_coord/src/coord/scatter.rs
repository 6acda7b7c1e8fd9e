//! Fan-out of framed sub-requests over reactor endpoints.
//!
//! `ScatterDispatcher::scatter` arms a `CompletionTracker`, sends one
//! `RequestFrame` per destination and keeps the matching `CompletionGuard`
//! until exactly one of these happens:
//! - a `ResponseFrame` with the same request id arrives (success unless the
//!   status is an error code);
//! - the request times out more than `max_retries` times;
//! - the send fails or the destination endpoint closes.
//!
//! The dispatcher is the `DispatchHandler` for its destination endpoints and
//! for its own timeout timers, so all completions run on the dispatch thread
//! except immediate send failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde::Serialize;

use super::completion::{CompletionGuard, CompletionTracker};
use super::reactor::ReactorHandle;
use super::types::{Connection, DispatchHandler, EndpointId, Event, ScatterConfig, TimerId};
use super::wire::{RequestFrame, ResponseFrame};

/// Counters since the dispatcher was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScatterStats {
    pub sent: u64,
    pub replies: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    replies: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

struct Pending {
    endpoint: EndpointId,
    frame: Bytes,
    retries: u32,
    timer: TimerId,
    guard: CompletionGuard,
}

#[derive(Default)]
struct Table {
    pending: HashMap<u32, Pending>,
    by_timer: HashMap<TimerId, u32>,
}

impl Table {
    fn take(&mut self, request_id: u32) -> Option<Pending> {
        let entry = self.pending.remove(&request_id)?;
        self.by_timer.remove(&entry.timer);
        Some(entry)
    }
}

pub struct ScatterDispatcher {
    config: ScatterConfig,
    me: Weak<ScatterDispatcher>,
    table: Mutex<Table>,
    next_request_id: AtomicU32,
    counters: Counters,
}

impl ScatterDispatcher {
    pub fn new(config: ScatterConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            table: Mutex::new(Table::default()),
            next_request_id: AtomicU32::new(1),
            counters: Counters::default(),
        })
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn as_handler(&self) -> Option<Arc<dyn DispatchHandler>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn DispatchHandler>)
    }

    /// Register a destination whose replies this dispatcher should see.
    pub fn register(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        connection: Arc<dyn Connection>,
    ) -> EndpointId {
        reactor.register(connection, self.clone())
    }

    pub async fn connect_tcp(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        addr: std::net::SocketAddr,
    ) -> anyhow::Result<EndpointId> {
        reactor.connect_tcp(addr, self.clone()).await
    }

    /// Send `command` with a per-destination body to every target.
    ///
    /// `tracker` is re-armed with `targets.len()`; wait on it for the
    /// aggregate outcome.
    pub fn scatter(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        tracker: &Arc<CompletionTracker>,
        command: u8,
        targets: Vec<(EndpointId, Bytes)>,
    ) {
        let guards = tracker.arm_guards(targets.len());
        for ((endpoint, body), guard) in targets.into_iter().zip(guards) {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let frame = RequestFrame {
                request_id,
                command,
                body,
            }
            .encode();

            // Track before sending: the reply may be dispatched before `send`
            // returns.
            let timer = reactor.schedule_after(self.config.request_timeout, self.clone());
            {
                let mut table = self.table();
                table.by_timer.insert(timer, request_id);
                table.pending.insert(
                    request_id,
                    Pending {
                        endpoint,
                        frame: frame.clone(),
                        retries: 0,
                        timer,
                        guard,
                    },
                );
            }

            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = reactor.send(endpoint, frame) {
                tracing::warn!(endpoint, request_id, error = %err, "scatter send failed");
                let entry = self.table().take(request_id);
                if let Some(entry) = entry {
                    reactor.cancel_timer(entry.timer);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    entry.guard.fail();
                }
            }
        }
    }

    /// Sub-requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.table().pending.len()
    }

    pub fn stats(&self) -> ScatterStats {
        ScatterStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            replies: self.counters.replies.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn on_reply(&self, reactor: &ReactorHandle, endpoint: EndpointId, payload: Bytes) {
        let response = match ResponseFrame::decode(payload) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "undecodable scatter reply");
                return;
            }
        };
        let entry = {
            let mut table = self.table();
            match table.pending.get(&response.request_id) {
                Some(entry) if entry.endpoint == endpoint => table.take(response.request_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            tracing::debug!(endpoint, request_id = response.request_id, "late or unknown reply");
            return;
        };
        reactor.cancel_timer(entry.timer);
        self.counters.replies.fetch_add(1, Ordering::Relaxed);
        if response.is_error() {
            tracing::debug!(
                endpoint,
                request_id = response.request_id,
                status = response.status,
                message = %response.message(),
                "sub-request failed"
            );
            entry.guard.fail();
        } else {
            entry.guard.succeed();
        }
    }

    fn on_timeout(&self, reactor: &ReactorHandle, timer_id: TimerId) {
        let mut table = self.table();
        let Some(request_id) = table.by_timer.remove(&timer_id) else {
            return;
        };
        let exhausted = match table.pending.get(&request_id) {
            Some(entry) => entry.retries >= self.config.max_retries,
            None => return,
        };

        if exhausted {
            let entry = table.take(request_id);
            drop(table);
            if let Some(entry) = entry {
                tracing::warn!(
                    endpoint = entry.endpoint,
                    request_id,
                    retries = entry.retries,
                    "sub-request timed out"
                );
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                entry.guard.fail();
            }
            return;
        }

        let Some(handler) = self.as_handler() else {
            return;
        };
        let timer = reactor.schedule_after(self.config.request_timeout, handler);
        table.by_timer.insert(timer, request_id);
        let Some(entry) = table.pending.get_mut(&request_id) else {
            return;
        };
        entry.timer = timer;
        entry.retries += 1;
        entry.guard.retried();
        let (endpoint, frame) = (entry.endpoint, entry.frame.clone());
        drop(table);

        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint, request_id, "re-sending sub-request");
        if let Err(err) = reactor.send(endpoint, frame) {
            tracing::warn!(endpoint, request_id, error = %err, "scatter re-send failed");
            if let Some(entry) = self.table().take(request_id) {
                reactor.cancel_timer(entry.timer);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                entry.guard.fail();
            }
        }
    }

    fn on_closed(&self, reactor: &ReactorHandle, endpoint: EndpointId) {
        let failed: Vec<Pending> = {
            let mut table = self.table();
            let ids: Vec<u32> = table
                .pending
                .iter()
                .filter(|(_, entry)| entry.endpoint == endpoint)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.take(id)).collect()
        };
        if !failed.is_empty() {
            tracing::warn!(endpoint, count = failed.len(), "destination closed with sub-requests in flight");
        }
        for entry in failed {
            reactor.cancel_timer(entry.timer);
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            entry.guard.fail();
        }
    }
}

impl DispatchHandler for ScatterDispatcher {
    fn handle(&self, reactor: &ReactorHandle, event: Event) {
        match event {
            Event::Data { endpoint, payload } => self.on_reply(reactor, endpoint, payload),
            Event::Timer { timer_id } => self.on_timeout(reactor, timer_id),
            Event::StateChange { endpoint, state } if state.is_terminal() => {
                self.on_closed(reactor, endpoint)
            }
            Event::StateChange { .. } => {}
        }
    }
}
