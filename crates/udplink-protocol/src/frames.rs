//! Frame builders and parsers for session-level packets.
//!
//! Layouts (all integers little-endian):
//! - ConnectRequest: `[prop][protocol id: u32][connection id: u64][payload...]`
//! - ConnectAccept: `[prop][connection id: u64]`
//! - Disconnect: `[prop][connection id: u64][payload...]`
//! - AlreadyDisconnected: `[prop]`
//! - Ping: `[prop][send millis: u32]`, Pong echoes the same field
//! - Data / UnconnectedMessage / Discovery*: `[prop][payload...]`

use udplink_core::{
    constants::{PROPERTY_HEADER_SIZE, PROTOCOL_ID},
    error::{ErrorKind, Result},
};

use crate::{
    property::PacketProperty,
    wire::{PacketReader, PacketWriter},
};

/// Total bytes before the payload of a connect request.
pub const CONNECT_REQUEST_HEADER_SIZE: usize = PROPERTY_HEADER_SIZE + 4 + 8;
/// Total bytes before the payload of a disconnect.
pub const DISCONNECT_HEADER_SIZE: usize = PROPERTY_HEADER_SIZE + 8;

/// Parsed view of a connect request.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectRequestFrame<'a> {
    /// Connection id minted by the connecting side.
    pub connection_id: u64,
    /// Application payload trailing the header.
    pub payload: &'a [u8],
}

/// Parsed view of a disconnect.
#[derive(Debug, PartialEq, Eq)]
pub struct DisconnectFrame<'a> {
    /// Connection id of the peer being torn down.
    pub connection_id: u64,
    /// Optional goodbye payload.
    pub payload: &'a [u8],
}

/// Builds a connect request for the configured protocol id.
pub fn connect_request(connection_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(PacketProperty::ConnectRequest.to_u8());
    writer.write_u32(PROTOCOL_ID);
    writer.write_u64(connection_id);
    writer.write_bytes(payload);
    writer.into_inner()
}

/// Parses a connect request body (property byte still at offset zero).
///
/// Rejects datagrams shorter than the fixed header and requests carrying a
/// foreign protocol id.
pub fn parse_connect_request(data: &[u8]) -> Result<ConnectRequestFrame<'_>> {
    if data.len() < CONNECT_REQUEST_HEADER_SIZE {
        return Err(ErrorKind::PacketTooShort);
    }
    let mut reader = PacketReader::new(&data[PROPERTY_HEADER_SIZE..]);
    if reader.read_u32()? != PROTOCOL_ID {
        return Err(ErrorKind::ProtocolMismatch);
    }
    let connection_id = reader.read_u64()?;
    Ok(ConnectRequestFrame { connection_id, payload: reader.read_remaining() })
}

/// Builds a connect accept echoing the connection id.
pub fn connect_accept(connection_id: u64) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(PacketProperty::ConnectAccept.to_u8());
    writer.write_u64(connection_id);
    writer.into_inner()
}

/// Parses a connect accept, returning the echoed connection id.
pub fn parse_connect_accept(data: &[u8]) -> Result<u64> {
    if data.len() < PROPERTY_HEADER_SIZE + 8 {
        return Err(ErrorKind::PacketTooShort);
    }
    PacketReader::new(&data[PROPERTY_HEADER_SIZE..]).read_u64()
}

/// Builds a disconnect carrying the connection id and an optional payload.
pub fn disconnect(connection_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(PacketProperty::Disconnect.to_u8());
    writer.write_u64(connection_id);
    writer.write_bytes(payload);
    writer.into_inner()
}

/// Parses a disconnect into its id and payload view.
pub fn parse_disconnect(data: &[u8]) -> Result<DisconnectFrame<'_>> {
    if data.len() < DISCONNECT_HEADER_SIZE {
        return Err(ErrorKind::PacketTooShort);
    }
    let mut reader = PacketReader::new(&data[PROPERTY_HEADER_SIZE..]);
    let connection_id = reader.read_u64()?;
    Ok(DisconnectFrame { connection_id, payload: reader.read_remaining() })
}

/// The single-byte already-disconnected reply.
pub fn already_disconnected() -> Vec<u8> {
    vec![PacketProperty::AlreadyDisconnected.to_u8()]
}

/// Builds a `[prop][payload]` frame for data, unconnected and discovery kinds.
pub fn tagged(property: PacketProperty, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(property.to_u8());
    writer.write_bytes(payload);
    writer.into_inner()
}

/// Builds a keepalive probe stamped with the sender's milliseconds counter.
pub fn ping(send_millis: u32) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(PacketProperty::Ping.to_u8());
    writer.write_u32(send_millis);
    writer.into_inner()
}

/// Builds the answer to a probe, echoing its milliseconds stamp.
pub fn pong(echoed_millis: u32) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(PacketProperty::Pong.to_u8());
    writer.write_u32(echoed_millis);
    writer.into_inner()
}

/// Reads the echoed milliseconds stamp out of a ping or pong.
pub fn parse_timestamp(data: &[u8]) -> Result<u32> {
    if data.len() < PROPERTY_HEADER_SIZE + 4 {
        return Err(ErrorKind::PacketTooShort);
    }
    PacketReader::new(&data[PROPERTY_HEADER_SIZE..]).read_u32()
}
