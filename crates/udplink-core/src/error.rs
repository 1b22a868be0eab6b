//! Error types and results.

use std::{
    fmt::{self, Display, Formatter},
    io,
};

/// Errors that can occur in the session and protocol layers.
#[derive(Debug)]
pub enum ErrorKind {
    /// Wrapper around a std io error.
    IoError(io::Error),
    /// The operation requires a started session manager.
    NotRunning,
    /// The session manager is already started.
    AlreadyRunning,
    /// A datagram was too short to carry the expected fields.
    PacketTooShort,
    /// The property byte did not name a known packet kind.
    InvalidProperty(u8),
    /// The connect request carried a foreign protocol identifier.
    ProtocolMismatch,
    /// A payload exceeded what the path MTU leaves room for.
    PayloadTooLarge {
        /// Size of the offending payload.
        size: usize,
        /// Largest payload the operation accepts.
        max: usize,
    },
}

impl Display for ErrorKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IoError(e) => write!(fmt, "An IO error occurred: {}", e),
            ErrorKind::NotRunning => write!(fmt, "The session manager is not running"),
            ErrorKind::AlreadyRunning => write!(fmt, "The session manager is already running"),
            ErrorKind::PacketTooShort => {
                write!(fmt, "The received datagram is too short to be valid")
            }
            ErrorKind::InvalidProperty(value) => {
                write!(fmt, "Unknown packet property: {}", value)
            }
            ErrorKind::ProtocolMismatch => {
                write!(fmt, "The connect request names a different protocol id")
            }
            ErrorKind::PayloadTooLarge { size, max } => {
                write!(fmt, "Payload of {} bytes exceeds the limit of {} bytes", size, max)
            }
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(inner: io::Error) -> Self {
        ErrorKind::IoError(inner)
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;
