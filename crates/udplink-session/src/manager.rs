//! Session manager: public API, classifier, tick driver, threading.
//!
//! Three thread roles meet here. The I/O thread blocks on the socket and
//! classifies every inbound datagram; the logic thread advances peer engines
//! on a fixed cadence; the host thread calls the public operations and
//! drains the event queue. Lock order, outermost first: peer table, shutdown
//! table, then a peer's engine; the event pool and queue are leaves. No lock
//! is held while host callbacks run, except in unsynced mode where the host
//! opted into inline dispatch.

use std::{
    collections::HashMap,
    convert::TryFrom,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, warn};
use udplink_core::{
    config::Config,
    constants::MAX_DATAGRAM_SIZE,
    engine::{ConnectionState, DeliveryMethod, EngineAction, EngineFactory},
    error::{ErrorKind, Result},
    transport::Transport,
};
use udplink_protocol::{frames, PacketProperty, PacketReader};

use crate::{
    event::{DisconnectReason, Event, EventKind, EventPool},
    listener::{ConnectionRequest, DisconnectInfo, EventListener, UnconnectedKind},
    nat::NatModule,
    peer::Peer,
    peer_table::{PeerTable, ShutdownTable},
    simulator::IngressSimulator,
    socket::UdpTransport,
    stats::{Statistics, StatisticsSnapshot},
};

/// Send errors that mean the datagram simply had nowhere to go right now:
/// WSAEHOSTUNREACH, WSAENETUNREACH, EHOSTUNREACH, ENETUNREACH.
const TRANSIENT_SEND_ERRORS: [i32; 4] = [10065, 10051, 113, 101];
/// Send errors for an oversized datagram: WSAEMSGSIZE and EMSGSIZE variants.
const OVERSIZE_SEND_ERRORS: [i32; 3] = [10040, 90, 40];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Work staged while a table lock is held, applied after release so host
/// callbacks and socket sends never run under a manager lock.
enum Staged {
    Send { address: SocketAddr, data: Vec<u8> },
    Receive { peer: Arc<Peer>, payload: Vec<u8> },
    Latency { peer: Arc<Peer>, millis: u32 },
    Disconnect { peer: Arc<Peer>, reason: DisconnectReason },
}

/// Coordinates one datagram socket with many remote peers.
///
/// Owns the peer table, classifies inbound datagrams, drives per-peer
/// engines from a logic thread, and hands events to the host through
/// [`SessionManager::poll_events`].
pub struct SessionManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    /// Handed to connection requests so the host's verdict finds its way back.
    this: Weak<Inner>,
    config: Config,
    listener: Arc<dyn EventListener>,
    factory: Arc<dyn EngineFactory>,
    nat: RwLock<Option<Arc<dyn NatModule>>>,
    socket: RwLock<Option<Arc<dyn Transport>>>,
    peers: Mutex<PeerTable>,
    shutdown_peers: Mutex<ShutdownTable>,
    pending_requests: Mutex<HashMap<SocketAddr, Arc<ConnectionRequest>>>,
    pool: EventPool,
    queue_tx: Sender<Event>,
    queue_rx: Receiver<Event>,
    simulator: Mutex<IngressSimulator>,
    stats: Statistics,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Creates a manager. Nothing touches the network until `start`.
    pub fn new(
        config: Config,
        listener: Arc<dyn EventListener>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        let max_peers = config.max_peers;
        Self {
            inner: Arc::new_cyclic(|this| Inner {
                this: this.clone(),
                config,
                listener,
                factory,
                nat: RwLock::new(None),
                socket: RwLock::new(None),
                peers: Mutex::new(PeerTable::new(max_peers)),
                shutdown_peers: Mutex::new(ShutdownTable::new()),
                pending_requests: Mutex::new(HashMap::new()),
                pool: EventPool::new(),
                queue_tx,
                queue_rx,
                simulator: Mutex::new(IngressSimulator::new()),
                stats: Statistics::default(),
                running: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers the consumer for NAT traversal datagrams.
    pub fn set_nat_module(&self, module: Arc<dyn NatModule>) {
        *self.inner.nat.write().expect("nat lock") = Some(module);
    }

    /// Binds the socket and starts the I/O and logic threads. Fails with
    /// [`ErrorKind::AlreadyRunning`] when already started.
    pub fn start(&self, port: u16) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::AlreadyRunning);
        }

        let transport = match UdpTransport::bind(port, &inner.config) {
            Ok(transport) => Arc::new(transport) as Arc<dyn Transport>,
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *inner.socket.write().expect("socket lock") = Some(transport.clone());

        let io = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("udplink-io".into())
                .spawn(move || Inner::io_loop(inner, transport))
                .map_err(ErrorKind::IoError)?
        };
        let logic = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("udplink-logic".into())
                .spawn(move || Inner::logic_loop(inner))
                .map_err(ErrorKind::IoError)?
        };
        let mut threads = lock(&inner.threads);
        threads.push(io);
        threads.push(logic);
        Ok(())
    }

    /// Sends a terminal disconnect to every peer, joins both internal
    /// threads and closes the socket. Idempotent; blocks until the threads
    /// are gone.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// True between a successful `start` and the matching `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.inner.socket() {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(ErrorKind::NotRunning),
        }
    }

    /// Initiates an outbound connection. Returns the existing handle when
    /// the address is already known (no new events are emitted), `None`
    /// when the peer table is full.
    pub fn connect(&self, address: SocketAddr, payload: &[u8]) -> Result<Option<Arc<Peer>>> {
        self.inner.connect(address, payload)
    }

    /// Queues `payload` for every connected peer, optionally skipping one.
    /// Datagrams leave on the next logic tick or an explicit flush.
    pub fn send_to_all(&self, payload: &[u8], method: DeliveryMethod, exclude: Option<&Arc<Peer>>) {
        let targets = lock(&self.inner.peers).snapshot();
        for peer in targets {
            if let Some(skip) = exclude {
                if Arc::ptr_eq(skip, &peer) {
                    continue;
                }
            }
            if peer.state() == ConnectionState::Connected {
                peer.send(payload, method);
            }
        }
    }

    /// Sends one unconnected message. The receiver decides whether to accept
    /// it; sending is not gated. Returns false when the send failed.
    pub fn send_unconnected_message(&self, payload: &[u8], address: SocketAddr) -> Result<bool> {
        self.inner.send_out_of_band(PacketProperty::UnconnectedMessage, payload, Some(address))
    }

    /// Broadcasts a discovery request to the LAN on `port`.
    pub fn send_discovery_request(&self, payload: &[u8], port: u16) -> Result<bool> {
        self.inner.send_broadcast(PacketProperty::DiscoveryRequest, payload, port)
    }

    /// Answers a discovery request with a unicast response.
    pub fn send_discovery_response(&self, payload: &[u8], address: SocketAddr) -> Result<bool> {
        self.inner.send_out_of_band(PacketProperty::DiscoveryResponse, payload, Some(address))
    }

    /// Pushes every peer's queued datagrams to the wire now.
    pub fn flush(&self) {
        let targets = lock(&self.inner.peers).snapshot();
        for peer in targets {
            let actions = peer.engine().flush();
            self.inner.apply_engine_actions(&peer, actions);
        }
    }

    /// Drains the event queue, dispatching each event to the listener on the
    /// calling thread. No-op when unsynced events are enabled.
    pub fn poll_events(&self) {
        let inner = &self.inner;
        while let Ok(event) = inner.queue_rx.try_recv() {
            inner.dispatch(&event);
            inner.pool.recycle(event);
        }
    }

    /// Starts a graceful disconnect: the disconnect packet is retransmitted
    /// until the remote acknowledges it. A payload that does not fit in the
    /// peer's MTU alongside the header is dropped with a log.
    pub fn disconnect_peer(&self, peer: &Arc<Peer>, payload: &[u8]) {
        self.inner.disconnect_peer(peer, payload, DisconnectReason::DisconnectPeerCalled);
    }

    /// Sends a single best-effort disconnect and forgets the peer.
    pub fn disconnect_peer_force(&self, peer: &Arc<Peer>) {
        self.inner.force_disconnect(peer, DisconnectReason::DisconnectPeerCalled, 0);
    }

    /// Snapshot of every peer currently in the peer table.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.inner.peers).snapshot()
    }

    /// Like [`SessionManager::peers`], reusing the caller's vector.
    pub fn peers_into(&self, out: &mut Vec<Arc<Peer>>) {
        lock(&self.inner.peers).snapshot_into(out);
    }

    /// Number of peers in the peer table.
    pub fn peers_count(&self) -> usize {
        lock(&self.inner.peers).len()
    }

    /// Number of peers whose graceful shutdown is still unacknowledged.
    pub fn shutdown_peers_count(&self) -> usize {
        lock(&self.inner.shutdown_peers).len()
    }

    /// Datagram and byte totals since construction.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn socket(&self) -> Option<Arc<dyn Transport>> {
        self.socket.read().expect("socket lock").clone()
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                error!("internal thread panicked during shutdown");
            }
        }

        // Best-effort goodbyes; nobody waits for the acknowledgement.
        let peers = lock(&self.peers).clear();
        if let Some(socket) = self.socket() {
            for peer in &peers {
                let packet = frames::disconnect(peer.connection_id(), &[]);
                let _ = socket.send_to(peer.address(), &packet);
            }
        }
        lock(&self.shutdown_peers).clear();
        lock(&self.pending_requests).clear();
        lock(&self.simulator).clear();
        *self.socket.write().expect("socket lock") = None;

        // Events still queued go back to the pool unseen.
        while let Ok(event) = self.queue_rx.try_recv() {
            self.pool.recycle(event);
        }
    }

    // ========================================================================
    // I/O thread
    // ========================================================================

    fn io_loop(inner: Arc<Inner>, socket: Arc<dyn Transport>) {
        let mut buffer = vec![0u8; inner.config.receive_buffer_max_size];
        while inner.running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buffer) {
                Ok((length, address)) => {
                    inner.stats.record_received(length);
                    let data = &buffer[..length];
                    if !inner.admit(address, data) {
                        continue;
                    }
                    // Host faults on the unsynced path must not tear down
                    // the receive thread.
                    let inner = &inner;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        inner.handle_datagram(address, data, Instant::now());
                    }));
                    if outcome.is_err() {
                        error!("receive handler panicked; datagram from {} dropped", address);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.on_receive_error(e);
                }
            }
        }
    }

    fn admit(&self, address: SocketAddr, data: &[u8]) -> bool {
        if !self.config.simulate_packet_loss && !self.config.simulate_latency {
            return true;
        }
        lock(&self.simulator).admit(&self.config, address, data, Instant::now())
    }

    fn on_receive_error(&self, e: std::io::Error) {
        error!("socket receive failed: {}", e);
        if self.config.clear_peers_on_receive_error {
            lock(&self.peers).clear();
        }
        self.emit_error(None, e.raw_os_error().unwrap_or(-1));
    }

    // ========================================================================
    // Packet classifier
    // ========================================================================

    pub(crate) fn handle_datagram(&self, address: SocketAddr, data: &[u8], now: Instant) {
        if data.is_empty() {
            debug!("empty datagram from {} dropped", address);
            return;
        }
        let property = match PacketProperty::try_from(data[0]) {
            Ok(property) => property,
            Err(_) => {
                debug!("datagram from {} with unknown property {} dropped", address, data[0]);
                return;
            }
        };

        match property {
            PacketProperty::DiscoveryRequest => {
                if self.config.discovery_enabled {
                    self.emit_unconnected(EventKind::DiscoveryRequest, address, &data[1..]);
                }
            }
            PacketProperty::DiscoveryResponse => {
                self.emit_unconnected(EventKind::DiscoveryResponse, address, &data[1..]);
            }
            PacketProperty::UnconnectedMessage => {
                if self.config.unconnected_messages_enabled {
                    self.emit_unconnected(EventKind::ReceiveUnconnected, address, &data[1..]);
                }
            }
            property if property.is_nat() => {
                if self.config.nat_punch_enabled {
                    let module = self.nat.read().expect("nat lock").clone();
                    if let Some(module) = module {
                        module.process_message(address, property, &data[1..]);
                    }
                }
            }
            PacketProperty::AlreadyDisconnected => {
                if lock(&self.shutdown_peers).take(&address).is_some() {
                    debug!("graceful shutdown acknowledged by {}", address);
                }
            }
            PacketProperty::Disconnect => self.handle_disconnect(address, data),
            PacketProperty::ConnectAccept => {
                let peer = lock(&self.peers).get(&address);
                if let Some(peer) = peer {
                    if peer.engine().process_connect_accept(data, now) {
                        self.emit_connect(peer);
                    }
                }
            }
            PacketProperty::ConnectRequest => self.handle_connect_request(address, data, now),
            _ => {
                // Data, ping, pong: the owning engine's business.
                let peer = lock(&self.peers).get(&address);
                if let Some(peer) = peer {
                    let actions = peer.engine().process_packet(data, now);
                    self.apply_engine_actions(&peer, actions);
                }
            }
        }
    }

    fn handle_disconnect(&self, address: SocketAddr, data: &[u8]) {
        let frame = match frames::parse_disconnect(data) {
            Ok(frame) => frame,
            Err(_) => {
                debug!("malformed disconnect from {} dropped", address);
                return;
            }
        };

        let removed = {
            let mut peers = lock(&self.peers);
            match peers.get(&address) {
                Some(peer) if peer.connection_id() == frame.connection_id => {
                    peers.remove(&address)
                }
                Some(_) => {
                    debug!("stale disconnect from {} discarded", address);
                    return;
                }
                None => None,
            }
        };

        if let Some(peer) = removed {
            self.emit_disconnect(peer, DisconnectReason::RemoteConnectionClose, 0, frame.payload);
        }
        // Either way the address is no longer in the peer table; tell the
        // remote so it can stop retransmitting.
        self.raw_send(address, &frames::already_disconnected());
    }

    fn handle_connect_request(&self, address: SocketAddr, data: &[u8], now: Instant) {
        // A known peer retransmitting its request lost our accept; the
        // engine answers with a fresh one.
        let existing = lock(&self.peers).get(&address);
        if let Some(peer) = existing {
            let actions = peer.engine().process_packet(data, now);
            self.apply_engine_actions(&peer, actions);
            return;
        }

        let frame = match frames::parse_connect_request(data) {
            Ok(frame) => frame,
            Err(ErrorKind::ProtocolMismatch) => {
                debug!("connect request from {} names a foreign protocol, dropped", address);
                return;
            }
            Err(_) => {
                debug!("undersized connect request from {} dropped", address);
                return;
            }
        };

        if lock(&self.peers).is_full() {
            debug!("peer table full, ignoring connect request from {}", address);
            return;
        }

        let request = {
            let mut pending = lock(&self.pending_requests);
            if pending.contains_key(&address) {
                // Retransmission while the host is still deciding.
                return;
            }
            let request = Arc::new(ConnectionRequest::new(
                frame.connection_id,
                address,
                frame.payload.to_vec(),
                self.this.clone(),
            ));
            pending.insert(address, request.clone());
            request
        };
        self.emit_connection_request(request);
    }

    // ========================================================================
    // Connection protocol
    // ========================================================================

    fn connect(&self, address: SocketAddr, payload: &[u8]) -> Result<Option<Arc<Peer>>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ErrorKind::NotRunning);
        }

        let now = Instant::now();
        let peer = {
            let mut peers = lock(&self.peers);
            if let Some(existing) = peers.get(&address) {
                return Ok(Some(existing));
            }
            if peers.is_full() {
                warn!("peer table full, cannot connect to {}", address);
                return Ok(None);
            }
            let connection_id = rand::random::<u64>();
            let engine = self.factory.outbound(connection_id, payload, &self.config, now);
            let peer = Arc::new(Peer::new(address, connection_id, engine));
            peers.insert(peer.clone());
            peer
        };

        // First connect request goes out immediately; the engine handles
        // retransmission from here.
        let actions = peer.engine().flush();
        self.apply_engine_actions(&peer, actions);
        Ok(Some(peer))
    }

    pub(crate) fn accept_request(&self, request: &ConnectionRequest) -> Option<Arc<Peer>> {
        lock(&self.pending_requests).remove(&request.remote_address());
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }

        let now = Instant::now();
        let peer = {
            let mut peers = lock(&self.peers);
            // The host may have connected outbound to the same address
            // while this request sat unresolved.
            if let Some(existing) = peers.get(&request.remote_address()) {
                return Some(existing);
            }
            if peers.is_full() {
                debug!("peer table filled up, dropping accepted request from {}",
                    request.remote_address());
                return None;
            }
            let engine = self.factory.inbound(request.connection_id(), &self.config, now);
            let peer = Arc::new(Peer::new(request.remote_address(), request.connection_id(), engine));
            peers.insert(peer.clone());
            peer
        };

        let actions = peer.engine().flush();
        self.apply_engine_actions(&peer, actions);
        self.emit_connect(peer.clone());
        Some(peer)
    }

    pub(crate) fn reject_request(&self, request: &ConnectionRequest) {
        lock(&self.pending_requests).remove(&request.remote_address());
        debug!("connection request from {} rejected", request.remote_address());
    }

    fn disconnect_peer(&self, peer: &Arc<Peer>, payload: &[u8], reason: DisconnectReason) {
        let payload = if !payload.is_empty() && payload.len() + 8 >= peer.mtu() {
            warn!(
                "disconnect payload of {} bytes does not fit the mtu of {}, dropping it",
                payload.len(),
                peer.mtu()
            );
            &[]
        } else {
            payload
        };
        let packet = frames::disconnect(peer.connection_id(), payload);

        {
            // The move between tables is atomic under both locks, taken in
            // the fixed peer-then-shutdown order.
            let mut peers = lock(&self.peers);
            if peers.remove(&peer.address()).is_none() {
                return;
            }
            peer.engine().shutdown(packet);
            lock(&self.shutdown_peers).insert(peer.clone());
        }

        let actions = peer.engine().flush();
        self.apply_engine_actions(peer, actions);
        self.emit_disconnect(peer.clone(), reason, 0, payload);
    }

    fn force_disconnect(&self, peer: &Arc<Peer>, reason: DisconnectReason, error_code: i32) {
        if lock(&self.peers).remove(&peer.address()).is_none() {
            return;
        }
        // One shot, no retransmission, no shutdown-table entry.
        if let Some(socket) = self.socket() {
            let packet = frames::disconnect(peer.connection_id(), &[]);
            if let Ok(length) = socket.send_to(peer.address(), &packet) {
                self.stats.record_sent(length);
            }
        }
        self.emit_disconnect(peer.clone(), reason, error_code, &[]);
    }

    // ========================================================================
    // Logic thread
    // ========================================================================

    fn logic_loop(inner: Arc<Inner>) {
        while inner.running.load(Ordering::SeqCst) {
            thread::sleep(inner.config.update_time);
            inner.tick(Instant::now());
        }
    }

    fn tick(&self, now: Instant) {
        // Datagrams the latency simulation held back are classified first so
        // their events order ahead of this tick's timeouts.
        if self.config.simulate_latency {
            let mut due = Vec::new();
            lock(&self.simulator).release_due(now, &mut due);
            for (address, data) in due {
                self.handle_datagram(address, &data, now);
            }
        }

        let mut staged: Vec<Staged> = Vec::new();
        {
            let mut peers = lock(&self.peers);
            let mut index = 0;
            while index < peers.len() {
                let peer = peers.at(index).clone();
                match peer.state() {
                    ConnectionState::Connected
                        if peer.time_since_last_packet_at(now) > self.config.disconnect_timeout =>
                    {
                        peers.remove(&peer.address());
                        staged.push(Staged::Disconnect { peer, reason: DisconnectReason::Timeout });
                        // Swap-with-last moved a fresh peer into this slot.
                        continue;
                    }
                    ConnectionState::Disconnected => {
                        peers.remove(&peer.address());
                        staged.push(Staged::Disconnect {
                            peer,
                            reason: DisconnectReason::ConnectionFailed,
                        });
                        continue;
                    }
                    _ => {
                        let actions = peer.engine().update(now);
                        stage_engine_actions(&peer, actions, &mut staged);
                        index += 1;
                    }
                }
            }
        }

        // Shutdown peers only retransmit their disconnect; entries whose
        // engine gave up are dropped without further events.
        for peer in lock(&self.shutdown_peers).snapshot() {
            let actions = peer.engine().update(now);
            stage_engine_actions(&peer, actions, &mut staged);
            if peer.state() == ConnectionState::Disconnected {
                lock(&self.shutdown_peers).take(&peer.address());
            }
        }

        self.apply_staged(staged);
    }

    // ========================================================================
    // Wire and event plumbing
    // ========================================================================

    fn apply_staged(&self, staged: Vec<Staged>) {
        for item in staged {
            match item {
                Staged::Send { address, data } => {
                    self.raw_send(address, &data);
                }
                Staged::Receive { peer, payload } => self.emit_receive(peer, &payload),
                Staged::Latency { peer, millis } => self.emit_latency(peer, millis),
                Staged::Disconnect { peer, reason } => {
                    self.emit_disconnect(peer, reason, 0, &[])
                }
            }
        }
    }

    fn apply_engine_actions(&self, peer: &Arc<Peer>, actions: Vec<EngineAction>) {
        let mut staged = Vec::with_capacity(actions.len());
        stage_engine_actions(peer, actions, &mut staged);
        self.apply_staged(staged);
    }

    /// Sends one datagram, routing failures through the send-error policy.
    fn raw_send(&self, address: SocketAddr, data: &[u8]) -> bool {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return false,
        };
        match socket.send_to(address, data) {
            Ok(length) => {
                self.stats.record_sent(length);
                true
            }
            Err(e) => {
                self.handle_send_error(address, e);
                false
            }
        }
    }

    fn handle_send_error(&self, address: SocketAddr, e: std::io::Error) {
        let code = e.raw_os_error().unwrap_or(-1);
        if TRANSIENT_SEND_ERRORS.contains(&code) {
            debug!("transient send error towards {}: {}", address, e);
            return;
        }
        if OVERSIZE_SEND_ERRORS.contains(&code) {
            warn!("datagram towards {} exceeds the path mtu: {}", address, e);
            return;
        }

        error!("send to {} failed: {}", address, e);
        let peer = lock(&self.peers).get(&address);
        if let Some(peer) = peer {
            self.force_disconnect(&peer, DisconnectReason::SocketSendError, code);
        }
        self.emit_error(Some(address), code);
    }

    fn send_out_of_band(
        &self,
        property: PacketProperty,
        payload: &[u8],
        address: Option<SocketAddr>,
    ) -> Result<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ErrorKind::NotRunning);
        }
        if payload.len() + 1 > MAX_DATAGRAM_SIZE {
            return Err(ErrorKind::PayloadTooLarge {
                size: payload.len(),
                max: MAX_DATAGRAM_SIZE - 1,
            });
        }
        let data = frames::tagged(property, payload);
        match address {
            Some(address) => Ok(self.raw_send(address, &data)),
            None => Ok(false),
        }
    }

    fn send_broadcast(&self, property: PacketProperty, payload: &[u8], port: u16) -> Result<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ErrorKind::NotRunning);
        }
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return Err(ErrorKind::NotRunning),
        };
        let data = frames::tagged(property, payload);
        match socket.send_broadcast(port, &data) {
            Ok(length) => {
                self.stats.record_sent(length);
                Ok(true)
            }
            Err(e) => {
                warn!("broadcast on port {} failed: {}", port, e);
                Ok(false)
            }
        }
    }

    /// Hands one event to the host: inline in unsynced mode, queued
    /// otherwise.
    fn emit(&self, event: Event) {
        if self.config.unsynced_events {
            self.dispatch(&event);
            self.pool.recycle(event);
        } else if self.queue_tx.send(event).is_err() {
            error!("event queue receiver vanished");
        }
    }

    fn dispatch(&self, event: &Event) {
        match event.kind {
            EventKind::Connect => {
                if let Some(peer) = &event.peer {
                    self.listener.on_peer_connected(peer.clone());
                }
            }
            EventKind::Disconnect => {
                if let Some(peer) = &event.peer {
                    self.listener.on_peer_disconnected(
                        peer.clone(),
                        DisconnectInfo {
                            reason: event.reason,
                            socket_error_code: event.aux,
                            data: PacketReader::new(&event.payload),
                        },
                    );
                }
            }
            EventKind::Receive => {
                if let Some(peer) = &event.peer {
                    self.listener.on_network_receive(peer.clone(), PacketReader::new(&event.payload));
                }
            }
            EventKind::ReceiveUnconnected => self.dispatch_unconnected(event, UnconnectedKind::Basic),
            EventKind::DiscoveryRequest => {
                self.dispatch_unconnected(event, UnconnectedKind::DiscoveryRequest)
            }
            EventKind::DiscoveryResponse => {
                self.dispatch_unconnected(event, UnconnectedKind::DiscoveryResponse)
            }
            EventKind::Error => self.listener.on_network_error(event.address, event.aux),
            EventKind::LatencyUpdate => {
                if let Some(peer) = &event.peer {
                    self.listener.on_network_latency_update(peer.clone(), event.aux as u32);
                }
            }
            EventKind::ConnectionRequest => {
                if let Some(request) = &event.request {
                    self.listener.on_connection_request(request.clone());
                }
            }
        }
    }

    fn dispatch_unconnected(&self, event: &Event, kind: UnconnectedKind) {
        if let Some(address) = event.address {
            self.listener.on_network_receive_unconnected(
                address,
                PacketReader::new(&event.payload),
                kind,
            );
        }
    }

    fn emit_connect(&self, peer: Arc<Peer>) {
        let mut event = self.pool.acquire(EventKind::Connect);
        event.peer = Some(peer);
        self.emit(event);
    }

    fn emit_disconnect(
        &self,
        peer: Arc<Peer>,
        reason: DisconnectReason,
        error_code: i32,
        payload: &[u8],
    ) {
        let mut event = self.pool.acquire(EventKind::Disconnect);
        event.peer = Some(peer);
        event.reason = reason;
        event.aux = error_code;
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_receive(&self, peer: Arc<Peer>, payload: &[u8]) {
        let mut event = self.pool.acquire(EventKind::Receive);
        event.peer = Some(peer);
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_unconnected(&self, kind: EventKind, address: SocketAddr, payload: &[u8]) {
        let mut event = self.pool.acquire(kind);
        event.address = Some(address);
        event.payload.extend_from_slice(payload);
        self.emit(event);
    }

    fn emit_error(&self, address: Option<SocketAddr>, code: i32) {
        let mut event = self.pool.acquire(EventKind::Error);
        event.address = address;
        event.aux = code;
        self.emit(event);
    }

    fn emit_latency(&self, peer: Arc<Peer>, millis: u32) {
        let mut event = self.pool.acquire(EventKind::LatencyUpdate);
        event.peer = Some(peer);
        event.aux = millis as i32;
        self.emit(event);
    }

    fn emit_connection_request(&self, request: Arc<ConnectionRequest>) {
        let mut event = self.pool.acquire(EventKind::ConnectionRequest);
        event.address = Some(request.remote_address());
        event.request = Some(request);
        self.emit(event);
    }
}

fn stage_engine_actions(peer: &Arc<Peer>, actions: Vec<EngineAction>, staged: &mut Vec<Staged>) {
    for action in actions {
        match action {
            EngineAction::Send(data) => {
                staged.push(Staged::Send { address: peer.address(), data })
            }
            EngineAction::Deliver(payload) => {
                staged.push(Staged::Receive { peer: peer.clone(), payload })
            }
            EngineAction::Latency(millis) => {
                staged.push(Staged::Latency { peer: peer.clone(), millis })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::Mutex,
        thread,
        time::{Duration, Instant},
    };

    use udplink_peer::BasicEngineFactory;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Recorded {
        Connect(SocketAddr),
        Disconnect(SocketAddr, DisconnectReason, Vec<u8>),
        Receive(SocketAddr, Vec<u8>),
        Unconnected(SocketAddr, UnconnectedKind, Vec<u8>),
        Error(Option<SocketAddr>, i32),
        Latency(SocketAddr, u32),
        Request(SocketAddr),
    }

    struct Recorder {
        events: Mutex<Vec<Recorded>>,
        requests: Mutex<Vec<Arc<ConnectionRequest>>>,
        auto_accept: bool,
    }

    impl Recorder {
        fn new(auto_accept: bool) -> Self {
            Self { events: Mutex::new(Vec::new()), requests: Mutex::new(Vec::new()), auto_accept }
        }

        fn push(&self, event: Recorded) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        fn take_request(&self) -> Option<Arc<ConnectionRequest>> {
            self.requests.lock().unwrap().pop()
        }
    }

    impl EventListener for Recorder {
        fn on_peer_connected(&self, peer: Arc<Peer>) {
            self.push(Recorded::Connect(peer.address()));
        }

        fn on_peer_disconnected(&self, peer: Arc<Peer>, info: DisconnectInfo<'_>) {
            let mut data = info.data;
            self.push(Recorded::Disconnect(
                peer.address(),
                info.reason,
                data.read_remaining().to_vec(),
            ));
        }

        fn on_network_receive(&self, peer: Arc<Peer>, mut reader: PacketReader<'_>) {
            self.push(Recorded::Receive(peer.address(), reader.read_remaining().to_vec()));
        }

        fn on_network_receive_unconnected(
            &self,
            address: SocketAddr,
            mut reader: PacketReader<'_>,
            kind: UnconnectedKind,
        ) {
            self.push(Recorded::Unconnected(address, kind, reader.read_remaining().to_vec()));
        }

        fn on_network_error(&self, address: Option<SocketAddr>, error_code: i32) {
            self.push(Recorded::Error(address, error_code));
        }

        fn on_network_latency_update(&self, peer: Arc<Peer>, latency_ms: u32) {
            self.push(Recorded::Latency(peer.address(), latency_ms));
        }

        fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
            self.push(Recorded::Request(request.remote_address()));
            if self.auto_accept {
                request.accept();
            } else {
                self.requests.lock().unwrap().push(request);
            }
        }
    }

    fn manager_with(config: Config, auto_accept: bool) -> (SessionManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::new(auto_accept));
        let manager =
            SessionManager::new(config, recorder.clone(), Arc::new(BasicEngineFactory));
        (manager, recorder)
    }

    fn started(config: Config, auto_accept: bool) -> (SessionManager, Arc<Recorder>) {
        let (manager, recorder) = manager_with(config, auto_accept);
        manager.start(0).unwrap();
        (manager, recorder)
    }

    /// A scripted remote: a plain socket whose datagrams we hand-craft.
    fn remote_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(1500))).unwrap();
        let address = socket.local_addr().unwrap();
        (socket, address)
    }

    fn inject(manager: &SessionManager, address: SocketAddr, data: &[u8]) {
        manager.inner().handle_datagram(address, data, Instant::now());
    }

    fn wait_for(manager: &SessionManager, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            manager.poll_events();
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Receives frames at a scripted remote until one starts with `property`.
    fn recv_frame(socket: &UdpSocket, property: PacketProperty) -> Option<Vec<u8>> {
        let mut buffer = [0u8; 2048];
        for _ in 0..32 {
            match socket.recv_from(&mut buffer) {
                Ok((length, _)) if length > 0 && buffer[0] == property.to_u8() => {
                    return Some(buffer[..length].to_vec());
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn start_is_exclusive_and_stop_is_idempotent() {
        let (manager, _) = manager_with(Config::default(), false);
        assert!(!manager.is_running());

        manager.start(0).unwrap();
        assert!(manager.is_running());
        assert!(matches!(manager.start(0), Err(ErrorKind::AlreadyRunning)));

        manager.stop();
        assert!(!manager.is_running());
        manager.stop();
        assert!(matches!(manager.local_addr(), Err(ErrorKind::NotRunning)));
    }

    #[test]
    fn operations_require_a_running_manager() {
        let (manager, _) = manager_with(Config::default(), false);
        let address = "127.0.0.1:5555".parse().unwrap();
        assert!(matches!(manager.connect(address, b""), Err(ErrorKind::NotRunning)));
        assert!(matches!(
            manager.send_unconnected_message(b"hi", address),
            Err(ErrorKind::NotRunning)
        ));
        assert!(matches!(manager.send_discovery_request(b"hi", 9), Err(ErrorKind::NotRunning)));
    }

    #[test]
    fn connect_is_idempotent_per_address() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        let first = manager.connect(address, b"hello").unwrap().unwrap();
        let second = manager.connect(address, b"hello").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.peers_count(), 1);

        manager.poll_events();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn connect_returns_none_when_the_table_is_full() {
        let mut config = Config::default();
        config.max_peers = 1;
        let (manager, _) = started(config, false);

        let (_a, first) = remote_socket();
        let (_b, second) = remote_socket();
        assert!(manager.connect(first, b"").unwrap().is_some());
        assert!(manager.connect(second, b"").unwrap().is_none());
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn inbound_request_is_accepted_into_a_connected_peer() {
        let (manager, recorder) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b"hello"));
        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Connect(address))
        }));
        assert!(recorder.events().contains(&Recorded::Request(address)));

        assert_eq!(manager.peers_count(), 1);
        let peer = manager.peers().pop().unwrap();
        assert_eq!(peer.connection_id(), 42);
        assert_eq!(peer.state(), ConnectionState::Connected);

        // The remote got its accept, echoing the minted id.
        let accept = recv_frame(&remote, PacketProperty::ConnectAccept).unwrap();
        assert_eq!(frames::parse_connect_accept(&accept).unwrap(), 42);
    }

    #[test]
    fn retransmitted_requests_fold_into_one_pending_request() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b"hello"));
        inject(&manager, address, &frames::connect_request(42, b"hello"));
        manager.poll_events();

        let requests: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Recorded::Request(_)))
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn rejected_requests_make_room_for_a_new_attempt() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        manager.poll_events();
        let request = recorder.take_request().unwrap();
        request.reject();
        assert_eq!(manager.peers_count(), 0);

        inject(&manager, address, &frames::connect_request(43, b""));
        manager.poll_events();
        let requests: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Recorded::Request(_)))
            .collect();
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn resolving_a_request_twice_is_inert() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        manager.poll_events();
        let request = recorder.take_request().unwrap();

        assert!(request.accept().is_some());
        assert!(request.accept().is_none());
        request.reject();
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn malformed_and_foreign_requests_are_silently_dropped() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        // Too short: header byte plus eleven bytes.
        let short = frames::connect_request(42, b"");
        inject(&manager, address, &short[..12]);

        // Right size, wrong protocol id.
        let mut foreign = frames::connect_request(42, b"");
        foreign[1] = foreign[1].wrapping_add(1);
        inject(&manager, address, &foreign);

        manager.poll_events();
        assert!(recorder.events().is_empty());
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn inbound_request_is_ignored_when_the_table_is_full() {
        let mut config = Config::default();
        config.max_peers = 1;
        let (manager, recorder) = started(config, true);

        let (_occupant, occupant) = remote_socket();
        manager.connect(occupant, b"").unwrap().unwrap();

        let (_remote, address) = remote_socket();
        inject(&manager, address, &frames::connect_request(42, b""));
        manager.poll_events();

        assert!(!recorder.events().contains(&Recorded::Request(address)));
        assert_eq!(manager.peers_count(), 1);
    }

    #[test]
    fn stale_disconnect_does_not_remove_the_peer() {
        let (manager, recorder) = started(Config::default(), true);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        inject(&manager, address, &frames::disconnect(99, b""));
        manager.poll_events();

        assert_eq!(manager.peers_count(), 1);
        assert!(!recorder
            .events()
            .iter()
            .any(|e| matches!(e, Recorded::Disconnect(_, _, _))));
    }

    #[test]
    fn matching_disconnect_removes_the_peer_and_replies() {
        let (manager, recorder) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        inject(&manager, address, &frames::disconnect(42, b"bye"));
        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Disconnect(
                address,
                DisconnectReason::RemoteConnectionClose,
                b"bye".to_vec(),
            ))
        }));
        assert_eq!(manager.peers_count(), 0);

        let reply = recv_frame(&remote, PacketProperty::AlreadyDisconnected).unwrap();
        assert_eq!(reply.len(), 1);
    }

    #[test]
    fn disconnect_for_an_unknown_peer_is_answered_with_already_disconnected() {
        let (manager, recorder) = started(Config::default(), false);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::disconnect(5, b""));
        manager.poll_events();

        assert!(recorder.events().is_empty());
        let reply = recv_frame(&remote, PacketProperty::AlreadyDisconnected).unwrap();
        assert_eq!(reply.len(), 1);
    }

    #[test]
    fn graceful_disconnect_travels_through_the_shutdown_table() {
        let (manager, recorder) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));
        let peer = manager.peers().pop().unwrap();

        manager.disconnect_peer(&peer, b"bye");
        assert_eq!(manager.peers_count(), 0);
        assert_eq!(manager.shutdown_peers_count(), 1);

        // The local event fires immediately; the wire carries id + payload.
        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Disconnect(
                address,
                DisconnectReason::DisconnectPeerCalled,
                b"bye".to_vec(),
            ))
        }));
        let packet = recv_frame(&remote, PacketProperty::Disconnect).unwrap();
        let frame = frames::parse_disconnect(&packet).unwrap();
        assert_eq!(frame.connection_id, 42);
        assert_eq!(frame.payload, b"bye");

        // The remote's acknowledgement clears the shutdown table.
        inject(&manager, address, &frames::already_disconnected());
        assert_eq!(manager.shutdown_peers_count(), 0);
    }

    #[test]
    fn oversized_goodbye_payload_is_dropped() {
        let (manager, recorder) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));
        let peer = manager.peers().pop().unwrap();

        let oversized = vec![0xAB; peer.mtu()];
        manager.disconnect_peer(&peer, &oversized);

        let packet = recv_frame(&remote, PacketProperty::Disconnect).unwrap();
        let frame = frames::parse_disconnect(&packet).unwrap();
        assert!(frame.payload.is_empty());

        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Disconnect(
                address,
                DisconnectReason::DisconnectPeerCalled,
                Vec::new(),
            ))
        }));
    }

    #[test]
    fn forced_disconnect_skips_the_shutdown_table() {
        let (manager, recorder) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));
        let peer = manager.peers().pop().unwrap();

        manager.disconnect_peer_force(&peer);
        assert_eq!(manager.peers_count(), 0);
        assert_eq!(manager.shutdown_peers_count(), 0);

        assert!(recv_frame(&remote, PacketProperty::Disconnect).is_some());
        assert!(wait_for(&manager, || {
            recorder
                .events()
                .iter()
                .any(|e| matches!(e, Recorded::Disconnect(a, _, _) if *a == address))
        }));
    }

    #[test]
    fn discovery_and_unconnected_gates_are_independent() {
        let mut config = Config::default();
        config.discovery_enabled = true;
        config.unconnected_messages_enabled = false;
        let (manager, recorder) = started(config, false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::tagged(PacketProperty::UnconnectedMessage, b"msg"));
        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryRequest, b"who"));
        manager.poll_events();

        let events = recorder.events();
        assert_eq!(
            events,
            vec![Recorded::Unconnected(address, UnconnectedKind::DiscoveryRequest, b"who".to_vec())]
        );
    }

    #[test]
    fn discovery_responses_are_never_gated() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryResponse, b"here"));
        manager.poll_events();

        assert_eq!(
            recorder.events(),
            vec![Recorded::Unconnected(address, UnconnectedKind::DiscoveryResponse, b"here".to_vec())]
        );
    }

    #[test]
    fn unknown_properties_and_empty_datagrams_are_dropped() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &[]);
        inject(&manager, address, &[200, 1, 2, 3]);
        manager.poll_events();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn data_from_a_connected_peer_becomes_a_receive_event() {
        let (manager, recorder) = started(Config::default(), true);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        inject(&manager, address, &frames::tagged(PacketProperty::Data, b"state"));
        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Receive(address, b"state".to_vec()))
        }));
    }

    #[test]
    fn data_from_strangers_is_dropped() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::tagged(PacketProperty::Data, b"state"));
        manager.poll_events();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn silent_peers_time_out() {
        let mut config = Config::default();
        config.disconnect_timeout = Duration::from_millis(100);
        config.update_time = Duration::from_millis(10);
        let (manager, recorder) = started(config, true);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Disconnect(
                address,
                DisconnectReason::Timeout,
                Vec::new(),
            ))
        }));
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn exhausted_handshakes_report_connection_failed() {
        let mut config = Config::default();
        config.reconnect_delay = Duration::from_millis(20);
        config.max_connect_attempts = 2;
        config.update_time = Duration::from_millis(10);
        let (manager, recorder) = started(config, false);

        // The remote exists but never answers.
        let (_remote, address) = remote_socket();
        manager.connect(address, b"").unwrap().unwrap();

        assert!(wait_for(&manager, || {
            recorder.events().contains(&Recorded::Disconnect(
                address,
                DisconnectReason::ConnectionFailed,
                Vec::new(),
            ))
        }));
        assert_eq!(manager.peers_count(), 0);
    }

    #[test]
    fn send_to_all_reaches_connected_peers_on_flush() {
        let (manager, _) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        manager.send_to_all(b"tick", DeliveryMethod::Unreliable, None);
        manager.flush();

        let frame = recv_frame(&remote, PacketProperty::Data).unwrap();
        assert_eq!(&frame[1..], b"tick");
    }

    #[test]
    fn send_to_all_honors_the_exclusion() {
        let (manager, _) = started(Config::default(), true);
        let (remote_a, address_a) = remote_socket();
        let (remote_b, address_b) = remote_socket();

        inject(&manager, address_a, &frames::connect_request(1, b""));
        inject(&manager, address_b, &frames::connect_request(2, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 2));

        let excluded = manager.peers().into_iter().find(|p| p.address() == address_a).unwrap();
        manager.send_to_all(b"tick", DeliveryMethod::Unreliable, Some(&excluded));
        manager.flush();

        assert!(recv_frame(&remote_b, PacketProperty::Data).is_some());
        remote_a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        assert!(recv_frame(&remote_a, PacketProperty::Data).is_none());
    }

    #[test]
    fn unconnected_sends_reach_the_wire() {
        let (manager, _) = started(Config::default(), false);
        let (remote, address) = remote_socket();

        assert!(manager.send_unconnected_message(b"hi", address).unwrap());
        let frame = recv_frame(&remote, PacketProperty::UnconnectedMessage).unwrap();
        assert_eq!(&frame[1..], b"hi");

        assert!(manager.send_discovery_response(b"srv", address).unwrap());
        let frame = recv_frame(&remote, PacketProperty::DiscoveryResponse).unwrap();
        assert_eq!(&frame[1..], b"srv");

        let stats = manager.statistics();
        assert!(stats.packets_sent >= 2);
        assert!(stats.bytes_sent >= 8);
    }

    #[test]
    fn oversized_out_of_band_payloads_are_refused() {
        let (manager, _) = started(Config::default(), false);
        let (_remote, address) = remote_socket();
        let payload = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(matches!(
            manager.send_unconnected_message(&payload, address),
            Err(ErrorKind::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unsynced_events_dispatch_inline() {
        let mut config = Config::default();
        config.discovery_enabled = true;
        config.unsynced_events = true;
        let (manager, recorder) = started(config, false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryRequest, b"who"));
        // No poll: the event already ran on this thread.
        assert_eq!(
            recorder.events(),
            vec![Recorded::Unconnected(address, UnconnectedKind::DiscoveryRequest, b"who".to_vec())]
        );
    }

    #[test]
    fn dispatched_events_return_to_the_pool() {
        let (manager, recorder) = started(Config::default(), false);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryResponse, b"a"));
        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryResponse, b"b"));
        manager.poll_events();

        assert_eq!(recorder.events().len(), 2);
        assert_eq!(manager.inner().pool.size(), 2);

        // The next event reuses a pooled record instead of growing the pool.
        inject(&manager, address, &frames::tagged(PacketProperty::DiscoveryResponse, b"c"));
        manager.poll_events();
        assert_eq!(manager.inner().pool.size(), 2);
    }

    #[test]
    fn stop_sends_terminal_disconnects_and_clears_the_tables() {
        let (manager, _) = started(Config::default(), true);
        let (remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        manager.stop();
        assert_eq!(manager.peers_count(), 0);
        assert_eq!(manager.shutdown_peers_count(), 0);

        let packet = recv_frame(&remote, PacketProperty::Disconnect).unwrap();
        assert_eq!(frames::parse_disconnect(&packet).unwrap().connection_id, 42);
    }

    #[test]
    fn nat_datagrams_reach_the_module_only_when_enabled() {
        struct CountingNat {
            seen: Mutex<Vec<(SocketAddr, PacketProperty)>>,
        }
        impl NatModule for CountingNat {
            fn process_message(
                &self,
                address: SocketAddr,
                property: PacketProperty,
                _payload: &[u8],
            ) {
                self.seen.lock().unwrap().push((address, property));
            }
        }

        let mut config = Config::default();
        config.nat_punch_enabled = true;
        let (manager, _) = started(config, false);
        let module = Arc::new(CountingNat { seen: Mutex::new(Vec::new()) });
        manager.set_nat_module(module.clone());

        let (_remote, address) = remote_socket();
        inject(&manager, address, &frames::tagged(PacketProperty::NatPunchMessage, b"punch"));
        inject(&manager, address, &frames::tagged(PacketProperty::NatIntroduction, b"intro"));
        assert_eq!(
            module.seen.lock().unwrap().clone(),
            vec![
                (address, PacketProperty::NatPunchMessage),
                (address, PacketProperty::NatIntroduction),
            ]
        );

        // With the gate closed the module sees nothing.
        let (gated, _) = started(Config::default(), false);
        let idle = Arc::new(CountingNat { seen: Mutex::new(Vec::new()) });
        gated.set_nat_module(idle.clone());
        inject(&gated, address, &frames::tagged(PacketProperty::NatPunchMessage, b"punch"));
        assert!(idle.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn latency_updates_flow_from_pong_answers() {
        let (manager, recorder) = started(Config::default(), true);
        let (_remote, address) = remote_socket();

        inject(&manager, address, &frames::connect_request(42, b""));
        assert!(wait_for(&manager, || manager.peers_count() == 1));

        // A pong stamped "now" reads as a near-zero round trip.
        inject(&manager, address, &frames::pong(0));
        assert!(wait_for(&manager, || {
            recorder.events().iter().any(|e| matches!(e, Recorded::Latency(a, _) if *a == address))
        }));
    }
}
