//! Session-based lock coordinator.
//!
//! Per handle the lock moves between `Unlocked`, `Shared(n)` and
//! `Exclusive(session)`. Incompatible requests queue (or are denied for
//! try-lock) in strict arrival order, and the queue is re-evaluated head-first
//! whenever holders or waiters change:
//! - a run of SHARED waiters at the head is granted together;
//! - an EXCLUSIVE waiter is granted alone and blocks everything behind it;
//! - new requests never barge past a non-empty queue.
//!
//! All state sits behind one coordinator-wide mutex. Replies and events are
//! collected while it is held and delivered after it is released, so a slow
//! or re-entrant response sink can never stall lock bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;

use super::error::{CoordError, ErrorCode};
use super::session::{Session, SessionRegistry};
use super::types::{CoordConfig, HandleId, LockMode, LockStatus, ResponseSink, SessionId};
use super::wire::{LockGrant, LockRequest};

/// Observable lock state of one handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Shared(usize),
    Exclusive(SessionId),
}

/// Immediate result of an acquire; the response sink sees the same outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted { generation: u64 },
    /// Try-lock on an incompatible handle.
    Denied,
    /// Parked in the wait queue; the response is deferred.
    Queued,
    Error(ErrorCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Explicit,
    HandleClosed,
    SessionClosed,
    SessionExpired,
}

/// Notifications for in-process observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LockEvent {
    LockAcquired {
        handle: HandleId,
        session: SessionId,
        mode: LockMode,
        generation: u64,
    },
    LockReleased {
        handle: HandleId,
        session: SessionId,
        reason: ReleaseReason,
    },
    /// Emitted after the forced releases of an expired session.
    SessionExpired {
        session: SessionId,
        released: Vec<HandleId>,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct HandleSnapshot {
    pub id: HandleId,
    pub name: String,
    pub state: LockState,
    pub holders: Vec<SessionId>,
    pub openers: usize,
    pub waiters: usize,
    pub generation: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorSnapshot {
    pub sessions: usize,
    pub handles: Vec<HandleSnapshot>,
    pub grants: u64,
    pub denials: u64,
    pub queued: u64,
    pub cancelled: u64,
    pub expired_sessions: u64,
    pub protocol_errors: u64,
}

struct Waiter {
    session: SessionId,
    mode: LockMode,
    sink: Box<dyn ResponseSink>,
}

struct HandleState {
    id: HandleId,
    name: String,
    holders: BTreeMap<SessionId, LockMode>,
    openers: BTreeSet<SessionId>,
    waiters: VecDeque<Waiter>,
    generation: u64,
}

impl HandleState {
    fn state(&self) -> LockState {
        match self.holders.iter().next() {
            None => LockState::Unlocked,
            Some((session, LockMode::Exclusive)) => LockState::Exclusive(*session),
            Some((_, LockMode::Shared)) => LockState::Shared(self.holders.len()),
        }
    }

    fn compatible(&self, mode: LockMode) -> bool {
        self.holders.values().all(|held| held.compatible_with(mode))
    }
}

enum Reply {
    Respond {
        sink: Box<dyn ResponseSink>,
        status: LockStatus,
        body: Bytes,
    },
    Error {
        sink: Box<dyn ResponseSink>,
        code: ErrorCode,
        message: String,
    },
}

impl Reply {
    fn deliver(self) {
        match self {
            Reply::Respond { sink, status, body } => sink.respond(status.code(), body),
            Reply::Error {
                sink,
                code,
                message,
            } => sink.error(code.code(), &message),
        }
    }
}

/// Replies and events produced by one operation.
#[derive(Default)]
struct Effects {
    replies: Vec<Reply>,
    events: Vec<LockEvent>,
}

impl Effects {
    fn respond(&mut self, sink: Box<dyn ResponseSink>, status: LockStatus, body: Bytes) {
        self.replies.push(Reply::Respond { sink, status, body });
    }

    fn reject(&mut self, sink: Box<dyn ResponseSink>, err: &CoordError) {
        self.replies.push(Reply::Error {
            sink,
            code: err.code(),
            message: err.to_string(),
        });
    }
}

struct Inner {
    sessions: SessionRegistry,
    handles: HashMap<HandleId, HandleState>,
    by_name: HashMap<String, HandleId>,
    next_handle: HandleId,
}

#[derive(Default)]
struct CoordMetrics {
    grants: AtomicU64,
    denials: AtomicU64,
    queued: AtomicU64,
    cancelled: AtomicU64,
    expired_sessions: AtomicU64,
    protocol_errors: AtomicU64,
}

pub struct LockCoordinator {
    config: CoordConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<LockEvent>,
    metrics: CoordMetrics,
}

impl LockCoordinator {
    pub fn new(config: CoordConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                sessions: SessionRegistry::new(config.lease_ttl),
                handles: HashMap::new(),
                by_name: HashMap::new(),
                next_handle: 1,
            }),
            config,
            events,
            metrics: CoordMetrics::default(),
        }
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver collected effects; must be called without the state lock.
    ///
    /// Events go out first so an observer has them by the time the affected
    /// client sees its reply.
    fn apply(&self, effects: Effects) {
        for event in effects.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        for reply in effects.replies {
            reply.deliver();
        }
    }

    pub fn create_session(&self, now: Instant) -> SessionId {
        let id = self.lock_inner().sessions.create(now);
        tracing::debug!(session = id, "session created");
        id
    }

    pub fn keep_alive(&self, session: SessionId, now: Instant) -> Result<Instant, CoordError> {
        self.lock_inner().sessions.touch(session, now)
    }

    pub fn session_count(&self) -> usize {
        self.lock_inner().sessions.len()
    }

    /// Close a session: release its locks, withdraw its queued requests and
    /// close its handles.
    pub fn close_session(&self, session: SessionId) -> Result<(), CoordError> {
        let mut effects = Effects::default();
        {
            let mut inner = self.lock_inner();
            if !inner.sessions.contains(session) {
                return Err(CoordError::SessionExpired(session));
            }
            self.teardown(&mut inner, session, ReleaseReason::SessionClosed, &mut effects);
        }
        tracing::debug!(session, "session closed");
        self.apply(effects);
        Ok(())
    }

    /// Open the resource `name` for `session`, creating its handle if needed.
    pub fn open(&self, session: SessionId, name: &str) -> Result<HandleId, CoordError> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let sess = inner
            .sessions
            .get_mut(session)
            .ok_or(CoordError::SessionExpired(session))?;

        let id = match inner.by_name.get(name) {
            Some(id) => *id,
            None => {
                let id = inner.next_handle;
                inner.next_handle += 1;
                inner.by_name.insert(name.to_string(), id);
                inner.handles.insert(
                    id,
                    HandleState {
                        id,
                        name: name.to_string(),
                        holders: BTreeMap::new(),
                        openers: BTreeSet::new(),
                        waiters: VecDeque::new(),
                        generation: 0,
                    },
                );
                tracing::debug!(handle = id, name, "handle created");
                id
            }
        };
        if let Some(handle) = inner.handles.get_mut(&id) {
            handle.openers.insert(session);
        }
        sess.opened.insert(id);
        Ok(id)
    }

    /// Close `handle` for `session`, releasing its lock or pending request.
    pub fn close(&self, session: SessionId, handle: HandleId) -> Result<(), CoordError> {
        let mut effects = Effects::default();
        {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let sess = inner
                .sessions
                .get_mut(session)
                .ok_or(CoordError::SessionExpired(session))?;
            if !sess.opened.remove(&handle) {
                return Err(CoordError::UnknownHandle(handle));
            }
            sess.held.remove(&handle);
            self.detach(inner, handle, session, ReleaseReason::HandleClosed, &mut effects);
        }
        self.apply(effects);
        Ok(())
    }

    /// Request `mode` on `handle`. The outcome is also sent to `sink`, except
    /// for `Queued`, whose response follows once the request is granted or
    /// withdrawn.
    pub fn acquire(
        &self,
        session: SessionId,
        handle: HandleId,
        mode: LockMode,
        try_only: bool,
        sink: Box<dyn ResponseSink>,
    ) -> LockOutcome {
        let mut effects = Effects::default();
        let outcome = {
            let mut guard = self.lock_inner();
            self.acquire_locked(&mut guard, session, handle, mode, try_only, sink, &mut effects)
        };
        self.apply(effects);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn acquire_locked(
        &self,
        inner: &mut Inner,
        session: SessionId,
        handle: HandleId,
        mode: LockMode,
        try_only: bool,
        sink: Box<dyn ResponseSink>,
        effects: &mut Effects,
    ) -> LockOutcome {
        let check = match inner.sessions.get(session) {
            None => Err(CoordError::SessionExpired(session)),
            Some(sess) if !sess.opened.contains(&handle) => Err(CoordError::UnknownHandle(handle)),
            Some(_) => match inner.handles.get(&handle) {
                None => Err(CoordError::UnknownHandle(handle)),
                Some(state)
                    if state.holders.contains_key(&session)
                        || state.waiters.iter().any(|w| w.session == session) =>
                {
                    Err(CoordError::AlreadyLocked(handle))
                }
                Some(_) => Ok(()),
            },
        };
        if let Err(err) = check {
            tracing::debug!(session, handle, error = %err, "lock request rejected");
            let code = err.code();
            effects.reject(sink, &err);
            return LockOutcome::Error(code);
        }

        let Inner {
            sessions, handles, ..
        } = inner;
        let Some(state) = handles.get_mut(&handle) else {
            let err = CoordError::UnknownHandle(handle);
            effects.reject(sink, &err);
            return LockOutcome::Error(err.code());
        };

        if state.waiters.is_empty() && state.compatible(mode) {
            let generation = grant(state, sessions, session, mode, effects);
            self.metrics.grants.fetch_add(1, Ordering::Relaxed);
            effects.respond(
                sink,
                LockStatus::Granted,
                LockGrant { generation }.encode(),
            );
            return LockOutcome::Granted { generation };
        }

        if try_only {
            self.metrics.denials.fetch_add(1, Ordering::Relaxed);
            effects.respond(sink, LockStatus::Busy, Bytes::new());
            return LockOutcome::Denied;
        }

        self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        state.waiters.push_back(Waiter {
            session,
            mode,
            sink,
        });
        tracing::debug!(
            session,
            handle,
            ?mode,
            depth = state.waiters.len(),
            "lock request queued"
        );
        LockOutcome::Queued
    }

    /// Decode a wire lock payload and acquire.
    ///
    /// Malformed payloads are answered on `sink` with a protocol error.
    pub fn dispatch_lock(
        &self,
        session: SessionId,
        payload: &[u8],
        sink: Box<dyn ResponseSink>,
    ) -> LockOutcome {
        let request = LockRequest::decode(payload).and_then(|req| {
            let mode = LockMode::from_bits(req.mode)?;
            Ok((req, mode))
        });
        match request {
            Ok((req, mode)) => self.acquire(session, req.handle, mode, req.try_lock, sink),
            Err(err) => {
                self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session, error = %err, "error handling lock message");
                let code = err.code();
                sink.error(code.code(), &format!("error handling lock message: {err}"));
                LockOutcome::Error(code)
            }
        }
    }

    /// Drop `session`'s lock on `handle` and grant the next compatible waiters.
    pub fn release(&self, session: SessionId, handle: HandleId) -> Result<(), CoordError> {
        let mut effects = Effects::default();
        {
            let mut guard = self.lock_inner();
            let Inner {
                sessions, handles, ..
            } = &mut *guard;
            let state = handles
                .get_mut(&handle)
                .ok_or(CoordError::UnknownHandle(handle))?;
            if state.holders.remove(&session).is_none() {
                return Err(CoordError::NotLocked(handle));
            }
            if let Some(sess) = sessions.get_mut(session) {
                sess.held.remove(&handle);
            }
            effects.events.push(LockEvent::LockReleased {
                handle,
                session,
                reason: ReleaseReason::Explicit,
            });
            self.pump(state, sessions, &mut effects);
        }
        self.apply(effects);
        Ok(())
    }

    /// Withdraw `session`'s queued request on `handle`, if any.
    ///
    /// The request's sink is answered with `Cancelled`; other waiters keep
    /// their order.
    pub fn cancel_pending(&self, session: SessionId, handle: HandleId) -> bool {
        let mut effects = Effects::default();
        let cancelled = {
            let mut guard = self.lock_inner();
            let Inner {
                sessions, handles, ..
            } = &mut *guard;
            match handles.get_mut(&handle) {
                Some(state) => {
                    let cancelled = self.withdraw(state, session, None, &mut effects);
                    if cancelled {
                        self.pump(state, sessions, &mut effects);
                    }
                    cancelled
                }
                None => false,
            }
        };
        self.apply(effects);
        cancelled
    }

    /// Reap every session whose lease lapsed at `now`.
    ///
    /// Each one is torn down exactly as if it had released every handle, then
    /// a `SessionExpired` event is emitted. Its queued requests are answered
    /// with a `SessionExpired` error.
    pub fn expire_sessions(&self, now: Instant) -> Vec<SessionId> {
        let mut effects = Effects::default();
        let expired = {
            let mut inner = self.lock_inner();
            // All lapsed sessions leave the registry before any cascade runs,
            // so a release never grants to a waiter expiring in this sweep.
            let lapsed = inner.sessions.expire_sweep(now);
            let closed: Vec<Session> = lapsed
                .into_iter()
                .filter_map(|id| inner.sessions.close(id))
                .collect();
            let mut expired = Vec::with_capacity(closed.len());
            for sess in closed {
                let session = sess.id;
                let released =
                    self.cascade(&mut inner, sess, ReleaseReason::SessionExpired, &mut effects);
                tracing::info!(session, released = ?released, "session lease expired");
                effects.events.push(LockEvent::SessionExpired { session, released });
                expired.push(session);
            }
            expired
        };
        self.metrics
            .expired_sessions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.apply(effects);
        expired
    }

    pub fn lock_state(&self, handle: HandleId) -> Option<LockState> {
        self.lock_inner().handles.get(&handle).map(HandleState::state)
    }

    pub fn queue_len(&self, handle: HandleId) -> Option<usize> {
        self.lock_inner()
            .handles
            .get(&handle)
            .map(|state| state.waiters.len())
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let inner = self.lock_inner();
        let mut handles: Vec<HandleSnapshot> = inner
            .handles
            .values()
            .map(|state| HandleSnapshot {
                id: state.id,
                name: state.name.clone(),
                state: state.state(),
                holders: state.holders.keys().copied().collect(),
                openers: state.openers.len(),
                waiters: state.waiters.len(),
                generation: state.generation,
            })
            .collect();
        handles.sort_by_key(|h| h.id);
        CoordinatorSnapshot {
            sessions: inner.sessions.len(),
            handles,
            grants: self.metrics.grants.load(Ordering::Relaxed),
            denials: self.metrics.denials.load(Ordering::Relaxed),
            queued: self.metrics.queued.load(Ordering::Relaxed),
            cancelled: self.metrics.cancelled.load(Ordering::Relaxed),
            expired_sessions: self.metrics.expired_sessions.load(Ordering::Relaxed),
            protocol_errors: self.metrics.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Remove `session` from the registry and from every handle it opened.
    fn teardown(
        &self,
        inner: &mut Inner,
        session: SessionId,
        reason: ReleaseReason,
        effects: &mut Effects,
    ) -> Vec<HandleId> {
        match inner.sessions.close(session) {
            Some(sess) => self.cascade(inner, sess, reason, effects),
            None => Vec::new(),
        }
    }

    /// Detach an already closed session from every handle it opened.
    fn cascade(
        &self,
        inner: &mut Inner,
        sess: Session,
        reason: ReleaseReason,
        effects: &mut Effects,
    ) -> Vec<HandleId> {
        let mut released = Vec::new();
        for handle in sess.opened {
            if self.detach(inner, handle, sess.id, reason, effects) {
                released.push(handle);
            }
        }
        released
    }

    /// Drop `session` as holder, waiter and opener of `handle`, re-evaluate
    /// the queue and destroy the handle once nobody has it open.
    ///
    /// Returns whether a held lock was released.
    fn detach(
        &self,
        inner: &mut Inner,
        handle: HandleId,
        session: SessionId,
        reason: ReleaseReason,
        effects: &mut Effects,
    ) -> bool {
        let Inner {
            sessions,
            handles,
            by_name,
            ..
        } = inner;
        let Some(state) = handles.get_mut(&handle) else {
            return false;
        };

        let expired = (reason == ReleaseReason::SessionExpired).then_some(session);
        self.withdraw(state, session, expired, effects);
        let released = state.holders.remove(&session).is_some();
        if released {
            effects.events.push(LockEvent::LockReleased {
                handle,
                session,
                reason,
            });
        }
        state.openers.remove(&session);
        self.pump(state, sessions, effects);

        if state.openers.is_empty() {
            // Waiters must have the handle open, so none can be left here.
            for waiter in state.waiters.drain(..) {
                effects.reject(waiter.sink, &CoordError::UnknownHandle(handle));
            }
            by_name.remove(&state.name);
            handles.remove(&handle);
            tracing::debug!(handle, "handle destroyed");
        }
        released
    }

    /// Remove `session`'s waiter from the queue. An expired session's waiter
    /// gets a `SessionExpired` error, otherwise `Cancelled`.
    fn withdraw(
        &self,
        state: &mut HandleState,
        session: SessionId,
        expired: Option<SessionId>,
        effects: &mut Effects,
    ) -> bool {
        let Some(pos) = state.waiters.iter().position(|w| w.session == session) else {
            return false;
        };
        let Some(waiter) = state.waiters.remove(pos) else {
            return false;
        };
        self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
        match expired {
            Some(id) => effects.reject(waiter.sink, &CoordError::SessionExpired(id)),
            None => effects.respond(waiter.sink, LockStatus::Cancelled, Bytes::new()),
        }
        true
    }

    /// Grant waiters from the head of the queue while they are compatible
    /// with the current holders.
    fn pump(&self, state: &mut HandleState, sessions: &mut SessionRegistry, effects: &mut Effects) {
        loop {
            let grantable = state
                .waiters
                .front()
                .is_some_and(|waiter| state.compatible(waiter.mode));
            if !grantable {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if !sessions.contains(waiter.session) {
                self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
                effects.reject(waiter.sink, &CoordError::SessionExpired(waiter.session));
                continue;
            }
            let generation = grant(state, sessions, waiter.session, waiter.mode, effects);
            self.metrics.grants.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                session = waiter.session,
                handle = state.id,
                mode = ?waiter.mode,
                "queued lock granted"
            );
            effects.respond(
                waiter.sink,
                LockStatus::Granted,
                LockGrant { generation }.encode(),
            );
        }
    }
}

fn grant(
    state: &mut HandleState,
    sessions: &mut SessionRegistry,
    session: SessionId,
    mode: LockMode,
    effects: &mut Effects,
) -> u64 {
    if mode == LockMode::Exclusive {
        state.generation += 1;
    }
    state.holders.insert(session, mode);
    if let Some(sess) = sessions.get_mut(session) {
        sess.held.insert(state.id);
    }
    effects.events.push(LockEvent::LockAcquired {
        handle: state.id,
        session,
        mode,
        generation: state.generation,
    });
    state.generation
}
