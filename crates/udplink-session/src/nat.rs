//! NAT-module handoff seam.

use std::net::SocketAddr;

use udplink_protocol::PacketProperty;

/// Passive consumer of NAT traversal datagrams.
///
/// The classifier routes `NatIntroductionRequest`, `NatIntroduction` and
/// `NatPunchMessage` datagrams here when NAT punching is enabled; their
/// contents are opaque to the session layer.
pub trait NatModule: Send + Sync {
    /// Handles one NAT datagram. `payload` starts after the property byte.
    fn process_message(&self, address: SocketAddr, property: PacketProperty, payload: &[u8]);
}
