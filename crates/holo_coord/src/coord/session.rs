//! Session table and lease bookkeeping.
//!
//! The registry only tracks leases and the handles a session touches; the
//! release cascade for an expired session is driven by the lock coordinator,
//! which owns the registry under its own mutex.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use super::error::CoordError;
use super::types::{HandleId, SessionId};

/// Lease state for one connected client.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub lease_expiry: Instant,
    /// Handles this session currently holds a lock on.
    pub held: BTreeSet<HandleId>,
    /// Handles this session has opened (held or not).
    pub opened: BTreeSet<HandleId>,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.lease_expiry
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    lease_ttl: Duration,
    next_id: SessionId,
}

impl SessionRegistry {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            lease_ttl,
            next_id: 1,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Start a new session with a fresh lease. Ids are never reused.
    pub fn create(&mut self, now: Instant) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(
            id,
            Session {
                id,
                lease_expiry: now + self.lease_ttl,
                held: BTreeSet::new(),
                opened: BTreeSet::new(),
            },
        );
        id
    }

    /// Renew the lease and return the new expiry.
    ///
    /// A session whose lease already lapsed cannot be revived, even if the
    /// sweep has not reaped it yet.
    pub fn touch(&mut self, id: SessionId, now: Instant) -> Result<Instant, CoordError> {
        let lease_ttl = self.lease_ttl;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoordError::SessionExpired(id))?;
        if session.is_expired(now) {
            return Err(CoordError::SessionExpired(id));
        }
        session.lease_expiry = now + lease_ttl;
        Ok(session.lease_expiry)
    }

    /// Sessions whose lease has lapsed at `now`, in id order.
    ///
    /// Read-only: the caller releases their handles and then calls `close`.
    pub fn expire_sweep(&self, now: Instant) -> Vec<SessionId> {
        let mut expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
