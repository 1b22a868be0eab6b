use std::convert::TryFrom;

use udplink_core::error::ErrorKind;

/// The one-byte packet-kind discriminator that begins every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketProperty {
    /// Application data routed to the owning peer's engine.
    Data = 0,
    /// Keepalive probe, answered with a pong.
    Ping = 1,
    /// Keepalive answer carrying the echoed probe timestamp.
    Pong = 2,
    /// Handshake opener: protocol id, connection id and the connect payload.
    ConnectRequest = 3,
    /// Handshake answer echoing the connection id.
    ConnectAccept = 4,
    /// Reliable disconnect carrying the connection id and an optional payload.
    Disconnect = 5,
    /// Single-byte reply confirming the sender no longer knows the peer.
    AlreadyDisconnected = 6,
    /// Application datagram exchanged without a prior handshake.
    UnconnectedMessage = 7,
    /// LAN discovery broadcast.
    DiscoveryRequest = 8,
    /// Unicast answer to a discovery broadcast.
    DiscoveryResponse = 9,
    /// NAT traversal: introduction request, opaque to the session layer.
    NatIntroductionRequest = 10,
    /// NAT traversal: introduction, opaque to the session layer.
    NatIntroduction = 11,
    /// NAT traversal: punch, opaque to the session layer.
    NatPunchMessage = 12,
}

impl PacketProperty {
    /// Returns the wire value of this property.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// True for the NAT-traversal kinds handed to the NAT module.
    pub fn is_nat(self) -> bool {
        matches!(
            self,
            PacketProperty::NatIntroductionRequest
                | PacketProperty::NatIntroduction
                | PacketProperty::NatPunchMessage
        )
    }
}

impl TryFrom<u8> for PacketProperty {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketProperty::Data),
            1 => Ok(PacketProperty::Ping),
            2 => Ok(PacketProperty::Pong),
            3 => Ok(PacketProperty::ConnectRequest),
            4 => Ok(PacketProperty::ConnectAccept),
            5 => Ok(PacketProperty::Disconnect),
            6 => Ok(PacketProperty::AlreadyDisconnected),
            7 => Ok(PacketProperty::UnconnectedMessage),
            8 => Ok(PacketProperty::DiscoveryRequest),
            9 => Ok(PacketProperty::DiscoveryResponse),
            10 => Ok(PacketProperty::NatIntroductionRequest),
            11 => Ok(PacketProperty::NatIntroduction),
            12 => Ok(PacketProperty::NatPunchMessage),
            other => Err(ErrorKind::InvalidProperty(other)),
        }
    }
}
