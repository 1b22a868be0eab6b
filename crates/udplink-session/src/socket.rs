//! UDP transport with socket-option plumbing.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::Duration,
};

use socket2::{Domain, Protocol, Socket as Socket2, Type};
use udplink_core::{config::Config, transport::Transport};

/// How long a blocking receive waits before checking the running flag.
const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Standard-library UDP socket behind the [`Transport`] seam.
///
/// Sends go through `&self` from the logic and host threads while the I/O
/// thread blocks in `recv_from`; `UdpSocket` is safe for that. The read
/// timeout keeps shutdown latency bounded.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds to `port` on all IPv4 interfaces, applying the socket options
    /// from `config`. Port zero picks an ephemeral port.
    pub fn bind(port: u16, config: &Config) -> io::Result<Self> {
        let socket = Socket2::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = config.socket_recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = config.socket_send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        // Discovery requests go to the broadcast address.
        socket.set_broadcast(true)?;

        let address = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&address.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECEIVE_POLL_TIMEOUT))?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn send_broadcast(&self, port: u16, payload: &[u8]) -> io::Result<usize> {
        let target = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::BROADCAST, port));
        self.socket.send_to(payload, target)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
