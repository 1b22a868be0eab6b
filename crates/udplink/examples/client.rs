//! Simple client that connects to a udplink server and prints echoes.
//!
//! Run the server first:
//! - cargo run -p udplink --example server -- 7777
//!
//! Then run the client:
//! - cargo run -p udplink --example client -- 127.0.0.1:7777
//! - cargo run -p udplink --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{env, net::SocketAddr, sync::Arc, thread, time::Duration};

use udplink::prelude::*;

struct PrintListener;

impl EventListener for PrintListener {
    fn on_peer_connected(&self, peer: Arc<Peer>) {
        println!("[connect] {}", peer.address());
    }

    fn on_peer_disconnected(&self, peer: Arc<Peer>, info: DisconnectInfo<'_>) {
        println!("[disconnect] {} ({:?})", peer.address(), info.reason);
    }

    fn on_network_receive(&self, peer: Arc<Peer>, mut reader: PacketReader<'_>) {
        let text = String::from_utf8_lossy(reader.read_remaining()).into_owned();
        println!("[reply] from={} payload=\"{}\"", peer.address(), text);
    }

    fn on_network_receive_unconnected(
        &self,
        _address: SocketAddr,
        _reader: PacketReader<'_>,
        _kind: UnconnectedKind,
    ) {
    }

    fn on_network_error(&self, address: Option<SocketAddr>, error_code: i32) {
        eprintln!("[error] address={:?} code={}", address, error_code);
    }

    fn on_network_latency_update(&self, peer: Arc<Peer>, latency_ms: u32) {
        println!("[latency] {} {}ms", peer.address(), latency_ms);
    }

    fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
        // Clients do not take inbound connections.
        request.reject();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr: SocketAddr =
        args.next().unwrap_or_else(|| "127.0.0.1:9050".to_string()).parse()?;
    let count: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(5);
    let interval_ms: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(300);

    let manager = SessionManager::new(
        Config::default(),
        Arc::new(PrintListener),
        Arc::new(BasicEngineFactory),
    );
    manager.start(0)?;
    println!(
        "udplink client bound to {} -> sending {} messages to {} (every {}ms)",
        manager.local_addr()?,
        count,
        server_addr,
        interval_ms
    );

    let peer = manager
        .connect(server_addr, b"example-client")?
        .expect("peer table cannot be full on a fresh client");

    for i in 0..count {
        let message = format!("hello {}", i);
        peer.send(message.as_bytes(), DeliveryMethod::Unreliable);
        manager.flush();

        let deadline = Duration::from_millis(interval_ms);
        let step = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            manager.poll_events();
            thread::sleep(step);
            waited += step;
        }
    }

    manager.disconnect_peer(&peer, b"done");
    manager.poll_events();
    manager.stop();
    println!("done");
    Ok(())
}
