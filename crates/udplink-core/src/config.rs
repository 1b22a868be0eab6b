use std::{default::Default, time::Duration};

#[derive(Clone, Debug)]
/// Configuration options to tune session and engine behavior.
pub struct Config {
    /// Maximum number of peers held in the peer table at once.
    pub max_peers: usize,
    /// Accept inbound unconnected-message datagrams and surface them as events.
    pub unconnected_messages_enabled: bool,
    /// Route NAT introduction/punch datagrams to the registered NAT module.
    pub nat_punch_enabled: bool,
    /// Accept inbound discovery-request datagrams and surface them as events.
    pub discovery_enabled: bool,
    /// Dispatch events inline on the emitting thread instead of queueing them
    /// for `poll_events`. Hosts enabling this bear responsibility for their
    /// own thread safety.
    pub unsynced_events: bool,
    /// Logic tick period.
    pub update_time: Duration,
    /// Keepalive ping interval, consumed by the peer engine.
    pub ping_interval: Duration,
    /// Max idle time before a connected peer is considered disconnected.
    pub disconnect_timeout: Duration,
    /// Interval between handshake (and reliable-disconnect) retransmissions,
    /// consumed by the peer engine.
    pub reconnect_delay: Duration,
    /// Number of connect-request transmissions before the handshake is
    /// abandoned, consumed by the peer engine.
    pub max_connect_attempts: u32,
    /// Allow outbound-packet batching in engines that support it.
    pub merge_enabled: bool,
    /// Bind the socket with SO_REUSEADDR.
    pub reuse_address: bool,
    /// Drop a percentage of inbound datagrams before classification.
    pub simulate_packet_loss: bool,
    /// Delay inbound datagrams by a uniform random latency before classification.
    pub simulate_latency: bool,
    /// Drop chance in percent applied when `simulate_packet_loss` is on.
    pub simulation_packet_loss_chance: u8,
    /// Lower bound of the simulated latency range.
    pub simulation_min_latency: Duration,
    /// Upper bound of the simulated latency range.
    pub simulation_max_latency: Duration,
    /// Clear the peer table when the socket reports a receive error.
    ///
    /// This matches the upstream behavior; disable to keep peers alive across
    /// transient receive failures.
    pub clear_peers_on_receive_error: bool,
    /// Max receive buffer size in bytes.
    pub receive_buffer_max_size: usize,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 64,
            unconnected_messages_enabled: false,
            nat_punch_enabled: false,
            discovery_enabled: false,
            unsynced_events: false,
            update_time: Duration::from_millis(15),
            ping_interval: Duration::from_millis(1000),
            disconnect_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(500),
            max_connect_attempts: 10,
            merge_enabled: false,
            reuse_address: false,
            simulate_packet_loss: false,
            simulate_latency: false,
            simulation_packet_loss_chance: 10,
            simulation_min_latency: Duration::from_millis(30),
            simulation_max_latency: Duration::from_millis(100),
            clear_peers_on_receive_error: true,
            receive_buffer_max_size: crate::constants::MAX_DATAGRAM_SIZE,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}
