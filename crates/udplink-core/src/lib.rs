#![warn(missing_docs)]

//! udplink-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core types shared across all layers:
//! - Configuration options
//! - Error handling
//! - Protocol constants
//! - Memory utilities (buffer pooling)
//! - The transport seam (pluggable datagram I/O)
//! - The peer-engine seam (per-peer reliability, consumed by the session layer)
//!
//! Wire-format logic lives in `udplink-protocol`; the session manager itself
//! lives in `udplink-session`.

/// Protocol constants shared across layers.
pub mod constants {
    /// Compile-time protocol identifier carried in every connect request.
    ///
    /// Mismatching requests are dropped without a reply.
    pub const PROTOCOL_ID: u32 = 4;
    /// Maximum transmission unit assumed for a path until the engine learns better.
    ///
    /// Derived from ethernet_mtu - ipv6_header_size - udp_header_size
    ///       1452 = 1500         - 40               - 8
    ///
    /// This is not strictly guaranteed -- there may be less room in an ethernet
    /// frame than this due to variability in ipv6 header size.
    pub const DEFAULT_MTU: usize = 1452;
    /// Size of the property byte that begins every datagram.
    pub const PROPERTY_HEADER_SIZE: usize = 1;
    /// Largest datagram the receive path will accept.
    pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;
}

/// Configuration options for the session layer and peer engines.
pub mod config;
/// Peer-engine interface consumed by the session manager.
pub mod engine;
/// Error types and results.
pub mod error;
/// Buffer pooling for memory efficiency.
pub mod pool;
/// Transport abstraction for pluggable I/O.
pub mod transport;
