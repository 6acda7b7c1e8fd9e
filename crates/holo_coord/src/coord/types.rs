//! Shared types for the coordination core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the reactor, the lock coordinator and the connection drivers alike.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::error::CoordError;
use super::reactor::ReactorHandle;

/// Session identifier; unique for the lifetime of the process.
pub type SessionId = u64;
/// Lockable resource identifier.
pub type HandleId = u64;
/// Identifier returned by the timer wheel.
pub type TimerId = u64;
/// Identifier assigned to a registered endpoint.
pub type EndpointId = u64;

/// Requested or held lock mode.
///
/// On the wire this is a bitmask: `0x1` shared, `0x2` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub const SHARED_BIT: u32 = 0x1;
    pub const EXCLUSIVE_BIT: u32 = 0x2;

    pub fn from_bits(bits: u32) -> Result<Self, CoordError> {
        match bits {
            Self::SHARED_BIT => Ok(Self::Shared),
            Self::EXCLUSIVE_BIT => Ok(Self::Exclusive),
            other => Err(CoordError::BadMode(other)),
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::Shared => Self::SHARED_BIT,
            Self::Exclusive => Self::EXCLUSIVE_BIT,
        }
    }

    /// Whether a holder in `self` mode can coexist with one in `other` mode.
    pub const fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// Status codes carried by successful lock responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    /// Try-lock found the handle busy.
    Busy,
    /// Request parked in the wait queue; never sent on the wire.
    Pending,
    /// A queued request was withdrawn before it could be granted.
    Cancelled,
}

impl LockStatus {
    pub const fn code(self) -> u32 {
        match self {
            Self::Granted => 1,
            Self::Busy => 2,
            Self::Pending => 3,
            Self::Cancelled => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Granted),
            2 => Some(Self::Busy),
            3 => Some(Self::Pending),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Lock service tuning.
#[derive(Clone, Debug)]
pub struct CoordConfig {
    /// Lease granted to a session on creation and on every renewal.
    pub lease_ttl: Duration,
    /// Granularity of the expiry sweep timer.
    ///
    /// A lapsed session is reaped at most one interval after its lease ends.
    pub sweep_interval: Duration,
    /// Buffer size for the lock event broadcast channel.
    pub event_capacity: usize,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(20),
            sweep_interval: Duration::from_millis(500),
            event_capacity: 1024,
        }
    }
}

/// Reactor tuning.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Worker threads for the I/O runtime that feeds the dispatch queue.
    pub io_threads: usize,
    /// Upper bound on one blocking wait when no timer is pending.
    pub idle_wait: Duration,
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            idle_wait: Duration::from_millis(250),
            thread_name: "holo-coord-io".to_string(),
        }
    }
}

/// Fan-out sub-request tuning.
#[derive(Clone, Debug)]
pub struct ScatterConfig {
    /// Time to wait for one reply before re-sending.
    pub request_timeout: Duration,
    /// Re-sends allowed after the first attempt before the sub-request fails.
    pub max_retries: u32,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            max_retries: 2,
        }
    }
}

/// Monotonic time source used for lease checks and timer deadlines.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to; used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) -> Instant {
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
        *now
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self
            .now
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connection lifecycle as reported to handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Established,
    Closed,
    Error(String),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Established)
    }
}

/// Event delivered by the reactor to a `DispatchHandler`.
#[derive(Clone, Debug)]
pub enum Event {
    Data {
        endpoint: EndpointId,
        payload: Bytes,
    },
    StateChange {
        endpoint: EndpointId,
        state: ConnectionState,
    },
    Timer {
        timer_id: TimerId,
    },
}

/// Receiver of reactor events.
///
/// Handlers run on the dispatch thread and must not block; long work belongs
/// on a timer or a separate worker.
pub trait DispatchHandler: Send + Sync + 'static {
    fn handle(&self, reactor: &ReactorHandle, event: Event);
}

/// Network-connection abstraction behind an endpoint.
///
/// `send` only queues bytes for the writer; it never waits on the network.
pub trait Connection: Send + Sync + 'static {
    fn send(&self, frame: Bytes) -> Result<(), CoordError>;
    fn close(&self);
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Destination for the single reply to one request.
///
/// Both methods consume the sink, so a request can be answered only once.
pub trait ResponseSink: Send + 'static {
    fn respond(self: Box<Self>, status: u32, payload: Bytes);
    fn error(self: Box<Self>, code: u32, message: &str);
}
