//! Peer-engine interface consumed by the session manager.
//!
//! The per-peer reliability engine (sequencing, retransmission, keepalive) is
//! a collaborator of the session layer, not part of it. The session manager
//! drives engines through this narrow interface and applies the actions they
//! return; engines never touch the socket or the event queue themselves.

use std::time::{Duration, Instant};

use crate::config::Config;

/// Connection lifecycle as observed by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound handshake in flight, waiting for the accept.
    Connecting,
    /// Handshake completed in both directions.
    Connected,
    /// Graceful disconnect initiated locally, waiting for the remote ack.
    ShutdownRequested,
    /// The engine gave up on the peer; the next logic tick removes it.
    Disconnected,
}

/// How a payload handed to [`PeerEngine::send`] should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMethod {
    /// Delivery and ordering both guaranteed.
    ReliableOrdered,
    /// Delivery guaranteed, ordering not.
    ReliableUnordered,
    /// Latest-wins: late datagrams are dropped instead of reordered.
    Sequenced,
    /// No guarantees.
    #[default]
    Unreliable,
}

/// Instructions an engine hands back to the session manager.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineAction {
    /// Send the given datagram to the peer's remote address.
    Send(Vec<u8>),
    /// Surface the given payload to the host as a receive event.
    Deliver(Vec<u8>),
    /// Report a fresh round-trip latency sample in milliseconds.
    Latency(u32),
}

/// Per-peer reliability engine.
///
/// One engine exists per peer for the peer's whole lifetime. All methods are
/// called with the session layer's peer lock held, so implementations need no
/// internal synchronization.
pub trait PeerEngine: Send {
    /// Advances timers: handshake and disconnect retransmission, keepalive.
    fn update(&mut self, time: Instant) -> Vec<EngineAction>;

    /// Ingests a connected-path datagram (property byte included).
    fn process_packet(&mut self, payload: &[u8], time: Instant) -> Vec<EngineAction>;

    /// Ingests a connect-accept datagram. Returns true exactly once, on the
    /// transition into [`ConnectionState::Connected`].
    fn process_connect_accept(&mut self, payload: &[u8], time: Instant) -> bool;

    /// Queues an application payload for transmission.
    fn send(&mut self, payload: &[u8], method: DeliveryMethod);

    /// Begins reliable retransmission of a prebuilt disconnect datagram and
    /// moves the engine into [`ConnectionState::ShutdownRequested`].
    fn shutdown(&mut self, packet: Vec<u8>);

    /// Drains everything queued for the wire without advancing timers.
    fn flush(&mut self) -> Vec<EngineAction>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Path MTU the engine currently assumes.
    fn mtu(&self) -> usize;

    /// Time elapsed since the last inbound datagram from this peer.
    fn time_since_last_packet(&self, time: Instant) -> Duration;
}

/// Creates engines for new peers.
///
/// The session manager mints the connection id; the factory decides which
/// engine implementation backs the peer.
pub trait EngineFactory: Send + Sync {
    /// Engine for an outbound peer: retransmits the connect request built
    /// from `payload` until accepted or out of attempts.
    fn outbound(
        &self,
        connection_id: u64,
        payload: &[u8],
        config: &Config,
        time: Instant,
    ) -> Box<dyn PeerEngine>;

    /// Engine for an accepted inbound peer: starts connected and answers the
    /// remote's handshake.
    fn inbound(&self, connection_id: u64, config: &Config, time: Instant) -> Box<dyn PeerEngine>;
}
