//! Coordination crate.
//!
//! This crate provides the event core and lock service used by holo_lockd and
//! by clients that fan writes out across storage nodes. Higher layers supply
//! `Connection`s and `DispatchHandler`s, then drive everything through a
//! `Reactor`.

pub mod coord;
