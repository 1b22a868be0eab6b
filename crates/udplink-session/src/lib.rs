#![warn(missing_docs)]

//! udplink-session: the session manager core.
//!
//! Coordinates a single datagram socket with many remote peers:
//! - connection establishment and reliable disconnection
//! - datagram classification into per-peer engines and out-of-band flows
//! - an I/O thread and a logic-tick thread feeding a host-polled event queue
//! - pooled events so the hot path stops allocating after warm-up
//! - unconnected messages, LAN discovery and NAT-module handoff
//!
//! The per-peer reliability engine is a collaborator, plugged in through
//! `udplink_core::engine`; `udplink-peer` ships a baseline implementation.

/// Pooled events and the dispatch queue.
pub mod event;
/// Host listener capability set and inbound connection requests.
pub mod listener;
/// Session manager: public API, classifier, tick driver, threading.
pub mod manager;
/// NAT-module handoff seam.
pub mod nat;
/// Peer handles owned by the session manager.
pub mod peer;
/// Address-indexed peer bookkeeping.
pub mod peer_table;
/// Debug-only inbound delay/drop pipeline.
pub mod simulator;
/// UDP transport with socket-option plumbing.
pub mod socket;
/// Send/receive counters.
pub mod stats;

pub use event::DisconnectReason;
pub use listener::{ConnectionRequest, DisconnectInfo, EventListener, UnconnectedKind};
pub use manager::SessionManager;
pub use nat::NatModule;
pub use peer::Peer;
pub use stats::StatisticsSnapshot;
