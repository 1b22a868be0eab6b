#![warn(missing_docs)]

//! udplink-peer: the baseline per-peer engine.
//!
//! Implements the `udplink-core` engine interface with just enough machinery
//! to drive a session end to end:
//! - connect-request retransmission until accepted or out of attempts
//! - connect-accept verification against the minted connection id
//! - reliable-disconnect retransmission during graceful shutdown
//! - ping/pong keepalive with round-trip latency reporting
//! - raw data passthrough and inactivity tracking
//!
//! Fragmentation, ack windows, channels and MTU probing belong to richer
//! engines; this one reports a fixed MTU.

mod engine;

pub use engine::{BasicEngine, BasicEngineFactory};
