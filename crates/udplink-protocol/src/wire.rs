//! Little-endian reader/writer over byte buffers.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use udplink_core::error::{ErrorKind, Result};

/// Appends little-endian fields to a growable buffer.
///
/// Thin wrapper so frame builders read as a sequence of field writes; the
/// inner vector can come from (and return to) a buffer pool.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Creates a writer over a fresh buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer over a recycled buffer, clearing it first.
    pub fn with_buffer(mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        Self { buffer }
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, value: u8) {
        // Infallible on Vec; the Write impl only errors on foreign sinks.
        let _ = WriteBytesExt::write_u8(&mut self.buffer, value);
    }

    /// Appends a little-endian u16.
    pub fn write_u16(&mut self, value: u16) {
        let _ = WriteBytesExt::write_u16::<LittleEndian>(&mut self.buffer, value);
    }

    /// Appends a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        let _ = WriteBytesExt::write_u32::<LittleEndian>(&mut self.buffer, value);
    }

    /// Appends a little-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        let _ = WriteBytesExt::write_u64::<LittleEndian>(&mut self.buffer, value);
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the finished datagram.
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    /// Current length of the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Bounds-checked little-endian reader over a borrowed payload slice.
///
/// Events hand one of these to the host; it must be consumed before the
/// callback returns, since the backing buffer is recycled afterwards.
#[derive(Debug, Clone, Copy)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over the given slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// True when every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the payload, without consuming it.
    pub fn peek_remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    /// Reads a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Reads `count` raw bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    /// Consumes and returns the unread tail.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(ErrorKind::PacketTooShort);
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
}
