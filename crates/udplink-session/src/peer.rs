use std::{
    fmt,
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use udplink_core::engine::{ConnectionState, DeliveryMethod, PeerEngine};

/// A remote peer owned by the session manager.
///
/// Handles are shared as `Arc<Peer>`: the manager keeps one in its tables,
/// events carry clones to the host. The address and connection id are fixed
/// for the peer's whole lifetime; everything that changes lives behind the
/// engine lock.
pub struct Peer {
    address: SocketAddr,
    connection_id: u64,
    engine: Mutex<Box<dyn PeerEngine>>,
}

impl Peer {
    pub(crate) fn new(
        address: SocketAddr,
        connection_id: u64,
        engine: Box<dyn PeerEngine>,
    ) -> Self {
        Self { address, connection_id, engine: Mutex::new(engine) }
    }

    /// The remote address this peer speaks from.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The 64-bit id minted at handshake, carried in every disconnect packet.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.engine().state()
    }

    /// Path MTU the engine currently assumes.
    pub fn mtu(&self) -> usize {
        self.engine().mtu()
    }

    /// Time elapsed since the last inbound datagram from this peer.
    pub fn time_since_last_packet(&self) -> Duration {
        self.time_since_last_packet_at(Instant::now())
    }

    pub(crate) fn time_since_last_packet_at(&self, time: Instant) -> Duration {
        self.engine().time_since_last_packet(time)
    }

    /// Queues an application payload for this peer. The datagram leaves on
    /// the next logic tick or an explicit flush.
    pub fn send(&self, payload: &[u8], method: DeliveryMethod) {
        self.engine().send(payload, method);
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, Box<dyn PeerEngine>> {
        // Engine mutex poisoning only happens if a holder panicked; the
        // engine state is still the best we have, so keep going.
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
