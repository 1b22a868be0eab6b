#![warn(missing_docs)]

//! udplink: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types to build reliable UDP apps:
//!
//! - Session management (`SessionManager`, `Peer`, `EventListener`)
//! - Connection handling (`ConnectionRequest`, `DisconnectReason`)
//! - Core configuration (`Config`) and the baseline engine factory
//!
//! Example
//! ```no_run
//! use std::sync::Arc;
//! use udplink::prelude::*;
//!
//! struct Quiet;
//! impl EventListener for Quiet {
//!     fn on_peer_connected(&self, peer: Arc<Peer>) {
//!         println!("connected: {}", peer.address());
//!     }
//!     fn on_peer_disconnected(&self, peer: Arc<Peer>, info: DisconnectInfo<'_>) {
//!         println!("gone: {} ({:?})", peer.address(), info.reason);
//!     }
//!     fn on_network_receive(&self, _peer: Arc<Peer>, _reader: PacketReader<'_>) {}
//!     fn on_network_receive_unconnected(
//!         &self,
//!         _address: std::net::SocketAddr,
//!         _reader: PacketReader<'_>,
//!         _kind: UnconnectedKind,
//!     ) {}
//!     fn on_network_error(&self, _address: Option<std::net::SocketAddr>, _code: i32) {}
//!     fn on_network_latency_update(&self, _peer: Arc<Peer>, _latency_ms: u32) {}
//!     fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
//!         request.accept();
//!     }
//! }
//!
//! let manager = SessionManager::new(
//!     Config::default(),
//!     Arc::new(Quiet),
//!     Arc::new(BasicEngineFactory),
//! );
//! manager.start(9050).unwrap();
//! loop {
//!     manager.poll_events();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

// Core config, errors and the engine/transport seams
pub use udplink_core::{
    config::Config,
    constants,
    engine::{ConnectionState, DeliveryMethod, EngineAction, EngineFactory, PeerEngine},
    error::{ErrorKind, Result},
    transport::Transport,
};
// Baseline engine
pub use udplink_peer::{BasicEngine, BasicEngineFactory};
// Wire helpers exposed through listener callbacks
pub use udplink_protocol::{PacketProperty, PacketReader, PacketWriter};
// Session management
pub use udplink_session::{
    ConnectionRequest, DisconnectInfo, DisconnectReason, EventListener, NatModule, Peer,
    SessionManager, StatisticsSnapshot, UnconnectedKind,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        BasicEngineFactory, Config, ConnectionRequest, ConnectionState, DeliveryMethod,
        DisconnectInfo, DisconnectReason, ErrorKind, EventListener, PacketReader, Peer,
        SessionManager, UnconnectedKind,
    };
}
