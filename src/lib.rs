//! Gossip relay node for an unobservable overlay network.
//!
//! Exposed as a library so integration tests can drive the peer and
//! API session state machines directly, in addition to the `gossip-relay`
//! binary that wires them into a running process (see `main.rs`).

pub mod api;
pub mod config;
pub mod error;
pub mod peer;
pub mod pow;
pub mod state;
pub mod wire;
