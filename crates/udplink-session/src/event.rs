//! Pooled events and the dispatch queue.
//!
//! Events are reusable records: acquired from a LIFO pool when something
//! happens, handed to the host through the queue (or inline in unsynced
//! mode), then reset and returned to the pool. After warm-up the pool is the
//! only allocator on the event path.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use crate::{listener::ConnectionRequest, peer::Peer};

/// Why a peer was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The outbound handshake ran out of attempts.
    ConnectionFailed,
    /// No datagram arrived within the disconnect timeout.
    Timeout,
    /// The remote sent a disconnect packet.
    RemoteConnectionClose,
    /// The local host asked for the disconnect.
    DisconnectPeerCalled,
    /// A fatal socket error surfaced while sending to the peer.
    SocketSendError,
}

/// Discriminates what a pooled [`Event`] currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Connect,
    Disconnect,
    Receive,
    ReceiveUnconnected,
    Error,
    LatencyUpdate,
    DiscoveryRequest,
    DiscoveryResponse,
    ConnectionRequest,
}

/// A reusable event record.
///
/// Exactly one of the optional fields is meaningful per kind; `reset` nulls
/// them all before the record goes back to the pool.
#[derive(Debug)]
pub(crate) struct Event {
    pub kind: EventKind,
    pub peer: Option<Arc<Peer>>,
    pub address: Option<SocketAddr>,
    pub payload: Vec<u8>,
    /// Latency in milliseconds or a socket error code, depending on kind.
    pub aux: i32,
    pub reason: DisconnectReason,
    pub request: Option<Arc<ConnectionRequest>>,
}

impl Event {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            peer: None,
            address: None,
            payload: Vec::new(),
            aux: 0,
            reason: DisconnectReason::ConnectionFailed,
            request: None,
        }
    }

    /// Clears every field so no peer handle or payload outlives dispatch.
    fn reset(&mut self) {
        self.peer = None;
        self.address = None;
        self.payload.clear();
        self.aux = 0;
        self.reason = DisconnectReason::ConnectionFailed;
        self.request = None;
    }
}

/// LIFO reservoir of event records.
#[derive(Debug, Default)]
pub(crate) struct EventPool {
    slots: Mutex<Vec<Event>>,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops a recycled record (or allocates one) and stamps its kind.
    pub fn acquire(&self, kind: EventKind) -> Event {
        let recycled = match self.slots.lock() {
            Ok(mut slots) => slots.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        match recycled {
            Some(mut event) => {
                event.kind = kind;
                event
            }
            None => Event::new(kind),
        }
    }

    /// Resets a dispatched record and pushes it back.
    pub fn recycle(&self, mut event: Event) {
        event.reset();
        match self.slots.lock() {
            Ok(mut slots) => slots.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    /// Number of records currently resting in the pool.
    pub fn size(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
