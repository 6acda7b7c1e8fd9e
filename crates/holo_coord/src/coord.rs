//! Coordination module wiring.
//!
//! `timer` and `reactor` form the event core, `net` drives TCP endpoints into
//! it, `session` and `lock` implement the lease-based lock service, and
//! `completion`/`scatter` track fanned-out sub-requests. `types`, `wire` and
//! `error` hold the shared contracts.

mod completion;
mod error;
mod lock;
mod net;
mod reactor;
mod scatter;
mod session;
mod timer;
mod types;
mod wire;

pub use completion::{CompletionGuard, CompletionTracker};
pub use error::{CoordError, ErrorCode, Result};
pub use lock::{
    CoordinatorSnapshot, HandleSnapshot, LockCoordinator, LockEvent, LockOutcome, LockState,
    ReleaseReason,
};
pub use reactor::{Reactor, ReactorHandle};
pub use scatter::{ScatterDispatcher, ScatterStats};
pub use session::{Session, SessionRegistry};
pub use timer::TimerWheel;
pub use types::{
    Clock, Connection, ConnectionState, CoordConfig, DispatchHandler, EndpointId, Event,
    HandleId, LockMode, LockStatus, ManualClock, MonotonicClock, ReactorConfig, ResponseSink,
    ScatterConfig, SessionId, TimerId,
};
pub use wire::{LockGrant, LockRequest, RequestFrame, ResponseFrame};
