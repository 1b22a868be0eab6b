//! Address-indexed peer bookkeeping.
//!
//! `PeerTable` holds active peers; `ShutdownTable` holds peers whose graceful
//! disconnect is still awaiting the remote's acknowledgement. At any instant
//! an address appears in at most one of the two. Both types are plain data;
//! the session manager guards each behind its own mutex and, when moving a
//! peer between them, always locks in the order peer table then shutdown
//! table.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use crate::peer::Peer;

/// Active peers: a hash map for O(1) lookup plus a compact array for
/// index-based tick iteration. Bounded by the configured capacity.
#[derive(Debug)]
pub struct PeerTable {
    by_address: HashMap<SocketAddr, Arc<Peer>>,
    list: Vec<Arc<Peer>>,
    capacity: usize,
}

impl PeerTable {
    /// Creates a table bounded at `capacity` peers.
    pub fn new(capacity: usize) -> Self {
        Self {
            by_address: HashMap::with_capacity(capacity),
            list: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of peers currently held.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when no peers are held.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// True when the capacity bound is reached.
    pub fn is_full(&self) -> bool {
        self.list.len() >= self.capacity
    }

    /// True when a peer exists for `address`.
    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.by_address.contains_key(address)
    }

    /// Returns the peer registered for `address`, if any.
    pub fn get(&self, address: &SocketAddr) -> Option<Arc<Peer>> {
        self.by_address.get(address).cloned()
    }

    /// Inserts a peer. Refused (returning false) when the table is full or
    /// the address is already taken, so an address can never map to two
    /// peers.
    pub fn insert(&mut self, peer: Arc<Peer>) -> bool {
        if self.is_full() || self.by_address.contains_key(&peer.address()) {
            return false;
        }
        self.by_address.insert(peer.address(), peer.clone());
        self.list.push(peer);
        true
    }

    /// Removes and returns the peer for `address`. The indexed array is
    /// compacted with swap-with-last, so callers iterating by index must not
    /// advance past a removal slot.
    pub fn remove(&mut self, address: &SocketAddr) -> Option<Arc<Peer>> {
        let peer = self.by_address.remove(address)?;
        if let Some(position) = self.list.iter().position(|p| p.address() == *address) {
            self.list.swap_remove(position);
        }
        Some(peer)
    }

    /// Indexed access for tick iteration.
    pub fn at(&self, index: usize) -> &Arc<Peer> {
        &self.list[index]
    }

    /// Copies all peer handles into `out` without allocating when `out` has
    /// capacity.
    pub fn snapshot_into(&self, out: &mut Vec<Arc<Peer>>) {
        out.clear();
        out.extend(self.list.iter().cloned());
    }

    /// Returns a fresh snapshot of all peer handles.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.list.clone()
    }

    /// Drops every peer, returning the drained handles.
    pub fn clear(&mut self) -> Vec<Arc<Peer>> {
        self.by_address.clear();
        std::mem::take(&mut self.list)
    }
}

/// Peers in graceful shutdown, keyed by remote address, waiting for the
/// remote's already-disconnected reply.
#[derive(Debug, Default)]
pub struct ShutdownTable {
    by_address: HashMap<SocketAddr, Arc<Peer>>,
}

impl ShutdownTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// True when no shutdowns are pending.
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// True when a shutdown is pending for `address`.
    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.by_address.contains_key(address)
    }

    /// Registers a peer whose disconnect retransmission just started.
    pub fn insert(&mut self, peer: Arc<Peer>) {
        self.by_address.insert(peer.address(), peer);
    }

    /// Removes and returns the entry for `address`, if any.
    pub fn take(&mut self, address: &SocketAddr) -> Option<Arc<Peer>> {
        self.by_address.remove(address)
    }

    /// Returns a snapshot of all pending handles for lock-free processing.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.by_address.values().cloned().collect()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.by_address.clear();
    }
}
