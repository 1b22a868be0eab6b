#![warn(missing_docs)]

//! udplink-protocol: the datagram wire format.
//!
//! Every datagram begins with a one-byte property discriminator; multi-byte
//! integers are little-endian throughout. This crate provides:
//! - `PacketProperty`: the property tag and its parsing
//! - frame builders/parsers for the session-level packet kinds
//! - `PacketReader` / `PacketWriter`: bounds-checked little-endian codec helpers

/// Frame builders and parsers for session-level packets.
pub mod frames;
/// The one-byte packet-kind discriminator.
pub mod property;
/// Little-endian reader/writer over byte buffers.
pub mod wire;

pub use frames::{ConnectRequestFrame, DisconnectFrame};
pub use property::PacketProperty;
pub use wire::{PacketReader, PacketWriter};
