/**
 * nat_traversal/peers.rs
 *
 * Client side view of the topic: known peers, which of them answered a
 * ping probe, and the background tasks feeding both.
 */

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::signalling::{self, JoinRequest, SignallingStream};
use super::types::{Peer, PeerList};
use crate::error::Result;

/// Liveness ping towards the coordination server
pub const RENDEZVOUS_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Hole punching probe interval
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);

pub const UNKNOWN_PEER: &str = "<unknown peer>";

/// Sends one ping probe to the given address
pub type PingFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Membership change produced by a peer list update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(Peer),
    Left(Peer),
}

/// Known peers keyed by traversal address, plus the hole punched subset
#[derive(Debug)]
pub struct PeerTable {
    self_addr: SocketAddr,
    peers: HashMap<SocketAddr, Peer>,
    hole_punched: HashSet<SocketAddr>,
}

impl PeerTable {
    pub fn new(self_addr: SocketAddr) -> Self {
        Self {
            self_addr,
            peers: HashMap::new(),
            hole_punched: HashSet::new(),
        }
    }

    /// Replace the whole membership with `list`.
    /// Departed peers lose their hole punched state; our own entry never
    /// produces an event.
    pub fn replace(&mut self, list: PeerList) -> Vec<PeerEvent> {
        let mut previous = std::mem::take(&mut self.peers);
        let mut events = Vec::new();

        for peer in list.peers {
            let addr = peer.addr();
            // several names may share one endpoint; it joins at most once
            let known = self.peers.contains_key(&addr) || previous.remove(&addr).is_some();
            if !known && addr != self.self_addr {
                events.push(PeerEvent::Joined(peer.clone()));
            }
            self.peers.insert(addr, peer);
        }

        for (addr, peer) in previous {
            if addr == self.self_addr {
                continue;
            }
            self.hole_punched.remove(&addr);
            events.push(PeerEvent::Left(peer));
        }

        events
    }

    /// Parse a pushed peer list and apply it. Malformed input leaves the table untouched.
    pub fn apply_json(&mut self, raw: &str) -> Result<Vec<PeerEvent>> {
        let list: PeerList = serde_json::from_str(raw)?;
        Ok(self.replace(list))
    }

    /// Record a ping probe from `addr`. Returns the peer only on its first
    /// transition to hole punched.
    pub fn mark_punched(&mut self, addr: SocketAddr) -> Option<&Peer> {
        let peer = self.peers.get(&addr)?;
        if self.hole_punched.insert(addr) {
            Some(peer)
        } else {
            None
        }
    }

    pub fn is_punched(&self, addr: &SocketAddr) -> bool {
        self.hole_punched.contains(addr)
    }

    pub fn name_of(&self, addr: &SocketAddr) -> &str {
        self.peers
            .get(addr)
            .map(|peer| peer.name.as_str())
            .unwrap_or(UNKNOWN_PEER)
    }

    /// Known peer addresses, ourselves excluded
    pub fn addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.peers
            .keys()
            .copied()
            .filter(move |addr| *addr != self.self_addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }
}

type SignallingSink = SplitSink<SignallingStream, Message>;

struct Shared {
    table: Mutex<PeerTable>,
    stopped: AtomicBool,
    sink: tokio::sync::Mutex<SignallingSink>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PeerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark stopped and close the connection; every task exits from here
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "closing rendezvous connection failed");
        }
    }

    fn handle_peer_list(&self, raw: &str) -> Result<()> {
        let events = self.table().apply_json(raw)?;

        for event in events {
            match event {
                PeerEvent::Joined(peer) => info!(addr = %peer.addr(), peer = %peer.name, "New peer"),
                PeerEvent::Left(peer) => info!(addr = %peer.addr(), peer = %peer.name, "Peer disconnected"),
            }
        }

        Ok(())
    }
}

/// Topic membership as pushed by the coordination server, with hole punch probing
pub struct PeerRegistry {
    shared: Arc<Shared>,
    self_peer: Peer,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerRegistry {
    /// Join the topic and start the keepalive, receive and probe tasks.
    /// `ping` is invoked for every known peer each [`PROBE_INTERVAL`].
    pub async fn connect(request: &JoinRequest, ping: PingFn) -> Result<Self> {
        let ws_stream = signalling::connect(request).await?;
        let (sink, stream) = ws_stream.split();

        let shared = Arc::new(Shared {
            table: Mutex::new(PeerTable::new(request.public_addr)),
            stopped: AtomicBool::new(false),
            sink: tokio::sync::Mutex::new(sink),
        });

        let tasks = vec![
            tokio::spawn(keep_alive(shared.clone())),
            tokio::spawn(receive(shared.clone(), stream)),
            tokio::spawn(probe(shared.clone(), ping)),
        ];

        debug!(topic = %request.topic, name = %request.name, "joined topic");

        Ok(Self {
            shared,
            self_peer: Peer::new(request.name.clone(), request.public_addr),
            tasks,
        })
    }

    /// Our own record
    pub fn self_peer(&self) -> &Peer {
        &self.self_peer
    }

    /// Call `f` for every known peer address, ourselves excluded.
    /// Runs under the registry lock; `f` must not block.
    pub fn for_each_peer_address(&self, mut f: impl FnMut(SocketAddr)) {
        let table = self.shared.table();
        for addr in table.addresses() {
            f(addr);
        }
    }

    /// Snapshot of the known peer addresses, ourselves excluded
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.shared.table().addresses().collect()
    }

    /// Display name for a sender address
    pub fn resolve_name(&self, addr: SocketAddr) -> String {
        self.shared.table().name_of(&addr).to_string()
    }

    /// A ping probe arrived from `addr`. Returns true on the first one.
    pub fn on_ping_received(&self, addr: SocketAddr) -> bool {
        let established = self
            .shared
            .table()
            .mark_punched(addr)
            .map(|peer| peer.name.clone());

        match established {
            Some(name) => {
                info!(addr = %addr, peer = %name, "Established connection");
                true
            }
            None => false,
        }
    }

    pub fn is_hole_punched(&self, addr: SocketAddr) -> bool {
        self.shared.table().is_punched(&addr)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Leave the topic and stop all background tasks
    pub async fn close(&self) {
        self.shared.stop().await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn keep_alive(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(RENDEZVOUS_KEEPALIVE_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shared.is_stopped() {
            break;
        }

        let sent = shared.sink.lock().await.send(Message::Ping(Vec::new())).await;
        if let Err(e) = sent {
            warn!(error = %e, "Failed to send ping message to server");
            shared.stop().await;
            break;
        }
    }
}

async fn receive(shared: Arc<Shared>, mut stream: SplitStream<SignallingStream>) {
    loop {
        if shared.is_stopped() {
            break;
        }

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = shared.handle_peer_list(&text) {
                    warn!(error = %e, "Failed to update peer list");
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                warn!("Coordination server closed the connection");
                shared.stop().await;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read message from server");
                shared.stop().await;
                break;
            }
        }
    }
}

async fn probe(shared: Arc<Shared>, ping: PingFn) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);

    loop {
        ticker.tick().await;
        if shared.is_stopped() {
            break;
        }

        // never hold the table lock across the callback
        let addrs: Vec<SocketAddr> = shared.table().addresses().collect();
        for addr in addrs {
            ping(addr);
        }
    }
}
