//! Host listener capability set and inbound connection requests.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tracing::debug;
use udplink_protocol::PacketReader;

use crate::{event::DisconnectReason, manager::Inner, peer::Peer};

/// Which flavor of out-of-band datagram an unconnected receive carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedKind {
    /// A plain unconnected application message.
    Basic,
    /// A LAN discovery broadcast looking for servers.
    DiscoveryRequest,
    /// A unicast answer to a discovery broadcast.
    DiscoveryResponse,
}

/// Details accompanying a peer disconnect.
#[derive(Debug)]
pub struct DisconnectInfo<'a> {
    /// Why the peer went away.
    pub reason: DisconnectReason,
    /// OS error code when `reason` is [`DisconnectReason::SocketSendError`],
    /// zero otherwise.
    pub socket_error_code: i32,
    /// Goodbye payload carried by a remote disconnect, empty otherwise.
    pub data: PacketReader<'a>,
}

/// Capability set the host provides to receive session events.
///
/// Callbacks run on the thread that calls `poll_events`, or, with unsynced
/// events enabled, on whichever internal thread emitted the event. Readers
/// borrow a pooled buffer: copy anything that must outlive the callback.
pub trait EventListener: Send + Sync {
    /// A peer completed its handshake.
    fn on_peer_connected(&self, peer: Arc<Peer>);

    /// A peer went away. This is the last event for the peer; the session
    /// manager drops its handle afterwards.
    fn on_peer_disconnected(&self, peer: Arc<Peer>, info: DisconnectInfo<'_>);

    /// Application data arrived from a connected peer.
    fn on_network_receive(&self, peer: Arc<Peer>, reader: PacketReader<'_>);

    /// An unconnected or discovery datagram arrived.
    fn on_network_receive_unconnected(
        &self,
        address: SocketAddr,
        reader: PacketReader<'_>,
        kind: UnconnectedKind,
    );

    /// The socket reported an error. `address` names the peer involved in a
    /// send failure; receive failures carry no address.
    fn on_network_error(&self, address: Option<SocketAddr>, error_code: i32);

    /// A fresh round-trip latency sample for a connected peer.
    fn on_network_latency_update(&self, peer: Arc<Peer>, latency_ms: u32);

    /// A remote asked to connect. Answer by calling
    /// [`ConnectionRequest::accept`] or [`ConnectionRequest::reject`],
    /// immediately or later; the first resolution wins.
    fn on_connection_request(&self, request: Arc<ConnectionRequest>);
}

/// An inbound handshake waiting for the host's verdict.
///
/// Retransmitted requests from the same address are folded into the pending
/// one, so the host sees each prospective peer exactly once.
pub struct ConnectionRequest {
    connection_id: u64,
    address: SocketAddr,
    payload: Vec<u8>,
    manager: Weak<Inner>,
    resolved: AtomicBool,
}

impl ConnectionRequest {
    pub(crate) fn new(
        connection_id: u64,
        address: SocketAddr,
        payload: Vec<u8>,
        manager: Weak<Inner>,
    ) -> Self {
        Self { connection_id, address, payload, manager, resolved: AtomicBool::new(false) }
    }

    /// The address asking to connect.
    pub fn remote_address(&self) -> SocketAddr {
        self.address
    }

    /// The connection id minted by the remote.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Reader over the payload trailing the connect request header.
    pub fn data(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }

    /// Admits the peer. Returns the created (or, after a race, the already
    /// present) peer handle; `None` when the manager stopped, the table
    /// filled up meanwhile, or the request was resolved before.
    pub fn accept(&self) -> Option<Arc<Peer>> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            debug!("connection request from {} was already resolved", self.address);
            return None;
        }
        let manager = self.manager.upgrade()?;
        manager.accept_request(self)
    }

    /// Turns the peer away. The request is dropped silently; no reject
    /// packet is sent.
    pub fn reject(&self) {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.reject_request(self);
        }
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("address", &self.address)
            .field("connection_id", &self.connection_id)
            .field("payload_len", &self.payload.len())
            .field("resolved", &self.resolved.load(Ordering::SeqCst))
            .finish()
    }
}
