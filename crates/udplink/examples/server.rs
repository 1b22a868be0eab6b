//! Simple echo server using udplink.
//!
//! Run:
//! - cargo run -p udplink --example server
//! - cargo run -p udplink --example server -- 7777

use std::{env, net::SocketAddr, sync::Arc, thread, time::Duration};

use udplink::prelude::*;

struct EchoListener;

impl EventListener for EchoListener {
    fn on_peer_connected(&self, peer: Arc<Peer>) {
        println!("[connect] {}", peer.address());
    }

    fn on_peer_disconnected(&self, peer: Arc<Peer>, info: DisconnectInfo<'_>) {
        println!("[disconnect] {} ({:?})", peer.address(), info.reason);
    }

    fn on_network_receive(&self, peer: Arc<Peer>, mut reader: PacketReader<'_>) {
        let payload = reader.read_remaining();
        let text = String::from_utf8_lossy(payload);
        println!("[packet] from={} payload=\"{}\"", peer.address(), text);
        // Echo back on the same link
        peer.send(payload, DeliveryMethod::Unreliable);
    }

    fn on_network_receive_unconnected(
        &self,
        address: SocketAddr,
        mut reader: PacketReader<'_>,
        kind: UnconnectedKind,
    ) {
        println!(
            "[unconnected] from={} kind={:?} len={}",
            address,
            kind,
            reader.read_remaining().len()
        );
    }

    fn on_network_error(&self, address: Option<SocketAddr>, error_code: i32) {
        eprintln!("[error] address={:?} code={}", address, error_code);
    }

    fn on_network_latency_update(&self, peer: Arc<Peer>, latency_ms: u32) {
        println!("[latency] {} {}ms", peer.address(), latency_ms);
    }

    fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
        println!("[request] from={}", request.remote_address());
        request.accept();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(9050);

    let manager = SessionManager::new(
        Config::default(),
        Arc::new(EchoListener),
        Arc::new(BasicEngineFactory),
    );
    manager.start(port)?;
    println!("udplink echo server listening on {}", manager.local_addr()?);

    loop {
        manager.poll_events();
        thread::sleep(Duration::from_millis(10));
    }
}
