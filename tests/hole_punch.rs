//! Full client flow over loopback: STUN discovery, rendezvous, probing, data

mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use punchline::nat_traversal::{ClientConfig, ConnectionState, NatTraversal, Received, TraversalSession};
use punchline::Error;
use tokio::sync::mpsc;

fn config(coord: SocketAddr, stun: SocketAddr, name: &str) -> ClientConfig {
    ClientConfig {
        coordination_url: format!("http://{}", coord),
        stun_server: stun.to_string(),
        topic: "chat".to_string(),
        name: name.to_string(),
        accept_invalid_certs: false,
    }
}

/// Log sink shared between the subscriber and the test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drive the receive side of a session, forwarding data messages
fn pump(session: Arc<TraversalSession>) -> mpsc::UnboundedReceiver<Received> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(received) = session.recv().await {
            if tx.send(received).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::test]
async fn test_peers_punch_and_exchange_data() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _log_guard = tracing::subscriber::set_default(subscriber);

    let (coord, _topics) = common::coord_server().await;
    let stun = common::stun_responder().await;

    let mut alice_nat = NatTraversal::new(config(coord, stun, "alice"));
    let alice = Arc::new(alice_nat.connect().await.unwrap());
    assert_eq!(alice_nat.state(), &ConnectionState::Connected);

    let mut bob_nat = NatTraversal::new(config(coord, stun, "bob"));
    let bob = Arc::new(bob_nat.connect().await.unwrap());

    let alice_addr = alice.socket().public_addr();
    let bob_addr = bob.socket().public_addr();
    assert_ne!(alice_addr, bob_addr);

    let mut alice_inbox = pump(alice.clone());
    let mut bob_inbox = pump(bob.clone());

    common::eventually(|| alice.registry().peer_addresses() == vec![bob_addr]).await;
    common::eventually(|| bob.registry().peer_addresses() == vec![alice_addr]).await;

    // each side probes the other every PROBE_INTERVAL
    common::eventually(|| alice.registry().is_hole_punched(bob_addr)).await;
    common::eventually(|| bob.registry().is_hole_punched(alice_addr)).await;

    assert_eq!(alice.broadcast(b"hello").await, 1);
    let received = bob_inbox.recv().await.unwrap();
    assert_eq!(received.from, alice_addr);
    assert_eq!(received.peer, "alice");
    assert_eq!(received.payload, b"hello");
    assert!(logs.text().contains("Sending data packet"));

    assert_eq!(bob.broadcast(b"hi alice").await, 1);
    let received = alice_inbox.recv().await.unwrap();
    assert_eq!(received.peer, "bob");
    assert_eq!(received.payload, b"hi alice");

    bob.close().await;
    common::eventually(|| alice.registry().peer_addresses().is_empty()).await;
    assert!(!alice.registry().is_hole_punched(bob_addr));
}

#[tokio::test]
async fn test_name_conflict_fails_pipeline() {
    let (coord, _topics) = common::coord_server().await;
    let stun = common::stun_responder().await;

    let mut first = NatTraversal::new(config(coord, stun, "alice"));
    let _session = first.connect().await.unwrap();

    let mut second = NatTraversal::new(config(coord, stun, "alice"));
    assert_eq!(second.state(), &ConnectionState::Idle);

    let result = second.connect().await;
    assert!(matches!(result, Err(Error::NameConflict { .. })));
    assert!(matches!(second.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_bad_coordination_url() {
    let stun = common::stun_responder().await;

    let mut nat = NatTraversal::new(ClientConfig {
        coordination_url: "ftp://coord.example".to_string(),
        ..config("127.0.0.1:1".parse().unwrap(), stun, "alice")
    });

    let result = nat.connect().await;
    assert!(matches!(result, Err(Error::Config(_))));
}
