//! Transport abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr};

/// Low-level datagram socket abstraction.
///
/// This trait allows various transports (UDP, loopback test doubles, etc.) to
/// be plugged into the session manager without coupling to a concrete
/// implementation. Implementations must be safe for concurrent sends while a
/// receive is in flight; the session layer sends from the logic and host
/// threads while its I/O thread blocks in `recv_from`.
pub trait Transport: Send + Sync {
    /// Sends a single datagram to the given address.
    fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Sends a single datagram to the IPv4 broadcast address on `port`.
    fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<usize>;

    /// Receives a single datagram, blocking up to the transport's read
    /// timeout. A timeout surfaces as `WouldBlock` or `TimedOut`.
    fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Returns the local address this transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
