//! Connection-facing lock service.
//!
//! `LockService` is the reactor handler for every client connection. It binds
//! each connection to at most one session, renews that session's lease on
//! every request, and turns commands into `LockCoordinator` calls. Replies go
//! back through `ConnectionSink`, which may be answered long after the request
//! was dispatched (queued locks).
//!
//! Design notes:
//! - A dropped connection only unbinds its session. The session survives
//!   until its lease lapses, so a client can reconnect and `AttachSession`.
//! - The lease sweep is a reactor timer that reschedules itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use holo_coord::coord::{
    CoordError, DispatchHandler, EndpointId, ErrorCode, Event, LockCoordinator, ReactorHandle,
    RequestFrame, ResponseFrame, ResponseSink, SessionId, TimerId,
};

use crate::protocol::{encode_u64, Command, SessionGrant, STATUS_OK};

/// Reply path for one request on one connection.
pub struct ConnectionSink {
    reactor: ReactorHandle,
    endpoint: EndpointId,
    request_id: u32,
}

impl ConnectionSink {
    fn send(self, frame: ResponseFrame) {
        if let Err(err) = self.reactor.send(self.endpoint, frame.encode()) {
            // The client is gone; nothing left to tell it.
            tracing::debug!(
                endpoint = self.endpoint,
                request_id = self.request_id,
                error = %err,
                "dropping reply"
            );
        }
    }
}

impl ResponseSink for ConnectionSink {
    fn respond(self: Box<Self>, status: u32, payload: Bytes) {
        let request_id = self.request_id;
        self.send(ResponseFrame {
            request_id,
            status,
            body: payload,
        });
    }

    fn error(self: Box<Self>, code: u32, message: &str) {
        let request_id = self.request_id;
        self.send(ResponseFrame::error(request_id, code, message));
    }
}

pub struct LockService {
    coordinator: Arc<LockCoordinator>,
    bindings: Mutex<HashMap<EndpointId, SessionId>>,
    sweep_timer: Mutex<Option<TimerId>>,
    me: Weak<LockService>,
}

impl LockService {
    pub fn new(coordinator: Arc<LockCoordinator>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            coordinator,
            bindings: Mutex::new(HashMap::new()),
            sweep_timer: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator> {
        &self.coordinator
    }

    /// Start the periodic lease sweep.
    pub fn start(&self, reactor: &ReactorHandle) {
        self.schedule_sweep(reactor);
    }

    /// Session currently bound to `endpoint`, if any.
    pub fn session_for(&self, endpoint: EndpointId) -> Option<SessionId> {
        self.bindings().get(&endpoint).copied()
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<EndpointId, SessionId>> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep_interval(&self) -> Duration {
        self.coordinator
            .config()
            .sweep_interval
            .max(Duration::from_millis(1))
    }

    fn schedule_sweep(&self, reactor: &ReactorHandle) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let timer = reactor.schedule_after(self.sweep_interval(), me);
        *self
            .sweep_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(timer);
    }

    fn sweep(&self, reactor: &ReactorHandle) {
        let expired = self.coordinator.expire_sessions(reactor.now());
        if !expired.is_empty() {
            self.bindings()
                .retain(|_, session| !expired.contains(session));
            tracing::info!(count = expired.len(), sessions = ?expired, "expired sessions reaped");
        }
        self.schedule_sweep(reactor);
    }

    fn on_frame(&self, reactor: &ReactorHandle, endpoint: EndpointId, payload: Bytes) {
        let frame = match RequestFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "undecodable request frame");
                let reply = ResponseFrame::error(0, ErrorCode::Protocol.code(), &err.to_string());
                let _ = reactor.send(endpoint, reply.encode());
                return;
            }
        };
        let sink = Box::new(ConnectionSink {
            reactor: reactor.clone(),
            endpoint,
            request_id: frame.request_id,
        });

        let command = match Command::decode(frame.command, frame.body) {
            Ok(Some(command)) => command,
            Ok(None) => {
                tracing::warn!(endpoint, command = frame.command, "unknown command");
                sink.error(
                    ErrorCode::UnknownCommand.code(),
                    &format!("unknown command {}", frame.command),
                );
                return;
            }
            Err(err) => {
                tracing::warn!(endpoint, command = frame.command, error = %err, "malformed command");
                sink.error(err.code().code(), &err.to_string());
                return;
            }
        };

        let session = match self.session_for(endpoint) {
            Some(session) => {
                // Any traffic from a bound session renews its lease.
                match self.coordinator.keep_alive(session, reactor.now()) {
                    Ok(_) => Some(session),
                    Err(err) => {
                        self.bindings().remove(&endpoint);
                        if command.needs_session() {
                            sink.error(err.code().code(), &err.to_string());
                            return;
                        }
                        None
                    }
                }
            }
            None => None,
        };

        match (command.needs_session(), session) {
            (true, None) => {
                sink.error(
                    ErrorCode::SessionExpired.code(),
                    "no session bound to this connection",
                );
            }
            (_, session) => self.execute(reactor, endpoint, session, command, sink),
        }
    }

    fn execute(
        &self,
        reactor: &ReactorHandle,
        endpoint: EndpointId,
        session: Option<SessionId>,
        command: Command,
        sink: Box<ConnectionSink>,
    ) {
        let result: Result<Bytes, CoordError> = match (command, session) {
            (Command::OpenSession, _) => {
                let session = self.coordinator.create_session(reactor.now());
                self.bindings().insert(endpoint, session);
                tracing::debug!(endpoint, session, "session opened");
                Ok(SessionGrant {
                    session,
                    lease_ttl_ms: self.coordinator.config().lease_ttl.as_millis() as u64,
                }
                .encode())
            }
            (Command::AttachSession { session }, _) => self
                .coordinator
                .keep_alive(session, reactor.now())
                .map(|_| {
                    self.bindings().insert(endpoint, session);
                    tracing::debug!(endpoint, session, "session attached");
                    Bytes::new()
                }),
            (Command::Stats, _) => match serde_json::to_vec(&self.coordinator.snapshot()) {
                Ok(json) => Ok(Bytes::from(json)),
                Err(err) => {
                    sink.error(ErrorCode::Internal.code(), &format!("encode stats: {err}"));
                    return;
                }
            },
            (Command::Lock { payload }, Some(session)) => {
                // Answered now or when the queued request resolves.
                self.coordinator.dispatch_lock(session, &payload, sink);
                return;
            }
            (command, Some(session)) => self.execute_session(endpoint, session, command),
            (_, None) => Err(CoordError::SessionExpired(0)),
        };

        match result {
            Ok(body) => sink.respond(STATUS_OK, body),
            Err(err) => sink.error(err.code().code(), &err.to_string()),
        }
    }

    fn execute_session(
        &self,
        endpoint: EndpointId,
        session: SessionId,
        command: Command,
    ) -> Result<Bytes, CoordError> {
        match command {
            Command::KeepAlive => Ok(Bytes::new()),
            Command::Open { name } => self.coordinator.open(session, &name).map(encode_u64),
            Command::Close { handle } => self.coordinator.close(session, handle).map(|_| Bytes::new()),
            Command::Release { handle } => self
                .coordinator
                .release(session, handle)
                .map(|_| Bytes::new()),
            Command::CancelLock { handle } => {
                let cancelled = self.coordinator.cancel_pending(session, handle);
                Ok(Bytes::from(vec![u8::from(cancelled)]))
            }
            Command::CloseSession => {
                self.bindings().remove(&endpoint);
                self.coordinator.close_session(session).map(|_| Bytes::new())
            }
            Command::OpenSession
            | Command::AttachSession { .. }
            | Command::Stats
            | Command::Lock { .. } => Err(CoordError::InvariantViolation(
                "session-free command routed as session command".to_string(),
            )),
        }
    }
}

impl DispatchHandler for LockService {
    fn handle(&self, reactor: &ReactorHandle, event: Event) {
        match event {
            Event::Data { endpoint, payload } => self.on_frame(reactor, endpoint, payload),
            Event::StateChange { endpoint, state } => {
                if state.is_terminal() {
                    let session = self.bindings().remove(&endpoint);
                    tracing::debug!(endpoint, ?session, ?state, "client connection ended");
                } else {
                    tracing::debug!(endpoint, "client connected");
                }
            }
            Event::Timer { timer_id } => {
                let ours = *self
                    .sweep_timer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    == Some(timer_id);
                if ours {
                    self.sweep(reactor);
                }
            }
        }
    }
}
