//! Debug-only inbound delay/drop pipeline.
//!
//! When loss or latency simulation is enabled, inbound datagrams pass
//! through here before classification. Dropped datagrams vanish; delayed
//! ones are copied into a holding list (the socket's receive buffer is
//! reused) and released by the logic tick once their deadline passes.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::debug;
use udplink_core::config::Config;

/// Delays shorter than this are not worth a copy and a tick round trip.
const MIN_HELD_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct HeldDatagram {
    release_at: Instant,
    address: SocketAddr,
    data: Vec<u8>,
}

/// In-memory delay/drop pipeline for received datagrams.
#[derive(Debug, Default)]
pub struct IngressSimulator {
    held: Vec<HeldDatagram>,
}

impl IngressSimulator {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides the fate of one inbound datagram. Returns true when the
    /// caller should classify it now; false when it was dropped or parked
    /// for later release.
    pub fn admit(
        &mut self,
        config: &Config,
        address: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> bool {
        let mut rng = rand::rng();

        if config.simulate_packet_loss
            && rng.random_range(0..100) < u32::from(config.simulation_packet_loss_chance)
        {
            debug!("simulated loss of a {} byte datagram from {}", data.len(), address);
            return false;
        }

        if config.simulate_latency {
            let min = config.simulation_min_latency;
            let max = config.simulation_max_latency.max(min);
            let delay = rng.random_range(min.as_millis() as u64..=max.as_millis() as u64);
            let delay = Duration::from_millis(delay);
            if delay > MIN_HELD_DELAY {
                self.held.push(HeldDatagram {
                    release_at: now + delay,
                    address,
                    data: data.to_vec(),
                });
                return false;
            }
        }

        true
    }

    /// Moves every datagram whose deadline has passed into `out`.
    pub fn release_due(&mut self, now: Instant, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        let mut index = 0;
        while index < self.held.len() {
            if self.held[index].release_at <= now {
                let held = self.held.swap_remove(index);
                out.push((held.address, held.data));
            } else {
                index += 1;
            }
        }
    }

    /// Number of datagrams currently parked.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Drops everything still parked.
    pub fn clear(&mut self) {
        self.held.clear();
    }
}
