use std::{
    collections::VecDeque,
    convert::TryFrom,
    time::{Duration, Instant},
};

use tracing::debug;
use udplink_core::{
    config::Config,
    constants::DEFAULT_MTU,
    engine::{ConnectionState, DeliveryMethod, EngineAction, EngineFactory, PeerEngine},
};
use udplink_protocol::{frames, PacketProperty};

/// Baseline peer engine.
///
/// Owns the per-peer half of the handshake and keepalive protocols. The
/// session manager calls in with its peer lock held, so no interior
/// synchronization is needed.
pub struct BasicEngine {
    state: ConnectionState,
    connection_id: u64,
    started: Instant,
    last_heard: Instant,

    // Handshake retransmission (outbound peers only)
    connect_packet: Option<Vec<u8>>,
    connect_attempts: u32,
    last_connect_sent: Instant,

    // Reliable-disconnect retransmission
    shutdown_packet: Option<Vec<u8>>,
    shutdown_attempts: u32,
    last_shutdown_sent: Option<Instant>,

    last_ping_sent: Instant,

    outgoing: VecDeque<Vec<u8>>,

    reconnect_delay: Duration,
    max_connect_attempts: u32,
    ping_interval: Duration,
}

impl BasicEngine {
    /// Engine for an outbound peer: queues the first connect request
    /// immediately and retransmits from `update`.
    pub fn new_outbound(connection_id: u64, payload: &[u8], config: &Config, time: Instant) -> Self {
        let mut engine = Self::empty(connection_id, ConnectionState::Connecting, config, time);
        let packet = frames::connect_request(connection_id, payload);
        engine.outgoing.push_back(packet.clone());
        engine.connect_packet = Some(packet);
        engine.connect_attempts = 1;
        engine
    }

    /// Engine for an accepted inbound peer: starts connected and queues the
    /// accept answering the remote's request.
    pub fn new_inbound(connection_id: u64, config: &Config, time: Instant) -> Self {
        let mut engine = Self::empty(connection_id, ConnectionState::Connected, config, time);
        engine.outgoing.push_back(frames::connect_accept(connection_id));
        engine
    }

    fn empty(connection_id: u64, state: ConnectionState, config: &Config, time: Instant) -> Self {
        Self {
            state,
            connection_id,
            started: time,
            last_heard: time,
            connect_packet: None,
            connect_attempts: 0,
            last_connect_sent: time,
            shutdown_packet: None,
            shutdown_attempts: 0,
            last_shutdown_sent: None,
            last_ping_sent: time,
            outgoing: VecDeque::new(),
            reconnect_delay: config.reconnect_delay,
            max_connect_attempts: config.max_connect_attempts,
            ping_interval: config.ping_interval,
        }
    }

    /// Milliseconds since the engine was created, truncated to the wire width.
    fn millis(&self, time: Instant) -> u32 {
        time.saturating_duration_since(self.started).as_millis() as u32
    }

    fn drain_outgoing(&mut self, actions: &mut Vec<EngineAction>) {
        while let Some(packet) = self.outgoing.pop_front() {
            actions.push(EngineAction::Send(packet));
        }
    }

    fn advance_handshake(&mut self, time: Instant) {
        if time.saturating_duration_since(self.last_connect_sent) < self.reconnect_delay {
            return;
        }
        if self.connect_attempts >= self.max_connect_attempts {
            debug!("connect attempts exhausted after {} tries", self.connect_attempts);
            self.state = ConnectionState::Disconnected;
            return;
        }
        if let Some(packet) = &self.connect_packet {
            self.outgoing.push_back(packet.clone());
            self.connect_attempts += 1;
            self.last_connect_sent = time;
        }
    }

    fn advance_shutdown(&mut self, time: Instant) {
        let last_sent = match self.last_shutdown_sent {
            // First resend interval starts at the first update after shutdown().
            None => {
                self.last_shutdown_sent = Some(time);
                return;
            }
            Some(at) => at,
        };
        if time.saturating_duration_since(last_sent) < self.reconnect_delay {
            return;
        }
        if self.shutdown_attempts >= self.max_connect_attempts {
            debug!("disconnect went unacknowledged after {} tries", self.shutdown_attempts);
            self.state = ConnectionState::Disconnected;
            return;
        }
        if let Some(packet) = &self.shutdown_packet {
            self.outgoing.push_back(packet.clone());
            self.shutdown_attempts += 1;
            self.last_shutdown_sent = Some(time);
        }
    }
}

impl PeerEngine for BasicEngine {
    fn update(&mut self, time: Instant) -> Vec<EngineAction> {
        match self.state {
            ConnectionState::Connecting => self.advance_handshake(time),
            ConnectionState::Connected => {
                if time.saturating_duration_since(self.last_ping_sent) >= self.ping_interval {
                    self.outgoing.push_back(frames::ping(self.millis(time)));
                    self.last_ping_sent = time;
                }
            }
            ConnectionState::ShutdownRequested => self.advance_shutdown(time),
            ConnectionState::Disconnected => {}
        }

        let mut actions = Vec::new();
        self.drain_outgoing(&mut actions);
        actions
    }

    fn process_packet(&mut self, payload: &[u8], time: Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let property = match payload.first().map(|b| PacketProperty::try_from(*b)) {
            Some(Ok(property)) => property,
            _ => return actions,
        };
        self.last_heard = time;

        match property {
            PacketProperty::Data => {
                // Data racing ahead of the accept must not surface before
                // the connect event does.
                if self.state == ConnectionState::Connected {
                    actions.push(EngineAction::Deliver(payload[1..].to_vec()));
                }
            }
            PacketProperty::Ping => {
                if let Ok(stamp) = frames::parse_timestamp(payload) {
                    actions.push(EngineAction::Send(frames::pong(stamp)));
                }
            }
            PacketProperty::Pong => {
                if let Ok(stamp) = frames::parse_timestamp(payload) {
                    let latency = self.millis(time).wrapping_sub(stamp);
                    actions.push(EngineAction::Latency(latency));
                }
            }
            // The remote kept retransmitting its request: our accept was lost.
            PacketProperty::ConnectRequest => {
                actions.push(EngineAction::Send(frames::connect_accept(self.connection_id)));
            }
            _ => {
                debug!("ignoring {:?} on the engine path", property);
            }
        }
        actions
    }

    fn process_connect_accept(&mut self, payload: &[u8], time: Instant) -> bool {
        let echoed = match frames::parse_connect_accept(payload) {
            Ok(id) => id,
            Err(_) => return false,
        };
        if echoed != self.connection_id {
            debug!("connect accept echoed a foreign id, ignoring");
            return false;
        }
        self.last_heard = time;
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.connect_packet = None;
            self.last_ping_sent = time;
            return true;
        }
        false
    }

    fn send(&mut self, payload: &[u8], _method: DeliveryMethod) {
        self.outgoing.push_back(frames::tagged(PacketProperty::Data, payload));
    }

    fn shutdown(&mut self, packet: Vec<u8>) {
        self.outgoing.push_back(packet.clone());
        self.shutdown_packet = Some(packet);
        self.shutdown_attempts = 1;
        self.last_shutdown_sent = None;
        self.state = ConnectionState::ShutdownRequested;
    }

    fn flush(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        self.drain_outgoing(&mut actions);
        actions
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    fn time_since_last_packet(&self, time: Instant) -> Duration {
        time.saturating_duration_since(self.last_heard)
    }
}

/// Factory producing [`BasicEngine`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEngineFactory;

impl EngineFactory for BasicEngineFactory {
    fn outbound(
        &self,
        connection_id: u64,
        payload: &[u8],
        config: &Config,
        time: Instant,
    ) -> Box<dyn PeerEngine> {
        Box::new(BasicEngine::new_outbound(connection_id, payload, config, time))
    }

    fn inbound(&self, connection_id: u64, config: &Config, time: Instant) -> Box<dyn PeerEngine> {
        Box::new(BasicEngine::new_inbound(connection_id, config, time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sends(actions: &[EngineAction]) -> Vec<&Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                EngineAction::Send(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn outbound_engine_queues_the_first_request() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_outbound(42, b"hello", &Config::default(), start);

        let actions = engine.flush();
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        let frame = frames::parse_connect_request(sent[0]).unwrap();
        assert_eq!(frame.connection_id, 42);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn handshake_retransmits_on_the_reconnect_delay() {
        let config = Config::default();
        let start = Instant::now();
        let mut engine = BasicEngine::new_outbound(42, &[], &config, start);
        engine.flush();

        // Before the delay elapses, nothing goes out.
        assert!(sends(&engine.update(start + config.reconnect_delay / 2)).is_empty());

        let actions = engine.update(start + config.reconnect_delay);
        assert_eq!(sends(&actions).len(), 1);
    }

    #[test]
    fn handshake_gives_up_after_max_attempts() {
        let mut config = Config::default();
        config.max_connect_attempts = 3;
        let start = Instant::now();
        let mut engine = BasicEngine::new_outbound(42, &[], &config, start);
        engine.flush();

        let mut time = start;
        let mut resent = 0;
        for _ in 0..10 {
            time += config.reconnect_delay;
            resent += sends(&engine.update(time)).len();
        }

        // One attempt at creation, two resends, then the engine folds.
        assert_eq!(resent, 2);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn accept_transitions_exactly_once() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_outbound(42, &[], &Config::default(), start);

        assert!(!engine.process_connect_accept(&frames::connect_accept(99), start));
        assert_eq!(engine.state(), ConnectionState::Connecting);

        assert!(engine.process_connect_accept(&frames::connect_accept(42), start));
        assert_eq!(engine.state(), ConnectionState::Connected);

        // A duplicate accept must not produce a second connect event.
        assert!(!engine.process_connect_accept(&frames::connect_accept(42), start));
    }

    #[test]
    fn inbound_engine_answers_with_an_accept() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(7, &Config::default(), start);
        assert_eq!(engine.state(), ConnectionState::Connected);

        let actions = engine.flush();
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(frames::parse_connect_accept(sent[0]).unwrap(), 7);
    }

    #[test]
    fn duplicate_connect_request_is_answered_again() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(7, &Config::default(), start);
        engine.flush();

        let actions = engine.process_packet(&frames::connect_request(7, &[]), start);
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(frames::parse_connect_accept(sent[0]).unwrap(), 7);
    }

    #[test]
    fn data_is_delivered_only_once_connected() {
        let start = Instant::now();
        let datagram = frames::tagged(PacketProperty::Data, b"payload");

        let mut connecting = BasicEngine::new_outbound(1, &[], &Config::default(), start);
        assert!(connecting.process_packet(&datagram, start).is_empty());

        let mut connected = BasicEngine::new_inbound(1, &Config::default(), start);
        let actions = connected.process_packet(&datagram, start);
        assert_eq!(actions, vec![EngineAction::Deliver(b"payload".to_vec())]);
    }

    #[test]
    fn ping_is_echoed_and_pong_reports_latency() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(1, &Config::default(), start);
        engine.flush();

        let actions = engine.process_packet(&frames::ping(500), start);
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(frames::parse_timestamp(sent[0]).unwrap(), 500);

        // A pong stamped 40ms in the engine's past reads as 40ms round trip.
        let now = start + Duration::from_millis(140);
        let actions = engine.process_packet(&frames::pong(100), now);
        assert_eq!(actions, vec![EngineAction::Latency(40)]);
    }

    #[test]
    fn keepalive_fires_on_the_ping_interval() {
        let config = Config::default();
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(1, &config, start);
        engine.flush();

        assert!(sends(&engine.update(start + config.ping_interval / 2)).is_empty());

        let actions = engine.update(start + config.ping_interval);
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], PacketProperty::Ping.to_u8());
    }

    #[test]
    fn shutdown_retransmits_until_out_of_attempts() {
        let mut config = Config::default();
        config.max_connect_attempts = 2;
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(1, &config, start);
        engine.flush();

        let packet = frames::disconnect(1, b"bye");
        engine.shutdown(packet.clone());
        assert_eq!(engine.state(), ConnectionState::ShutdownRequested);

        // The first transmission is queued by shutdown itself.
        let actions = engine.flush();
        assert_eq!(sends(&actions), vec![&packet]);

        let mut time = start;
        let mut resent = 0;
        for _ in 0..8 {
            time += config.reconnect_delay;
            resent += sends(&engine.update(time)).len();
        }
        assert_eq!(resent, 1);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn inactivity_clock_follows_inbound_traffic() {
        let start = Instant::now();
        let mut engine = BasicEngine::new_inbound(1, &Config::default(), start);

        let later = start + Duration::from_millis(300);
        assert_eq!(engine.time_since_last_packet(later), Duration::from_millis(300));

        engine.process_packet(&frames::ping(0), later);
        assert_eq!(engine.time_since_last_packet(later), Duration::ZERO);
    }
}
