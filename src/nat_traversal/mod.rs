/**
 * nat_traversal/mod.rs
 *
 * Client side NAT traversal:
 * - STUN discovery on a socket shared with peer traffic
 * - WebSocket rendezvous client
 * - Peer registry driving UDP hole punching
 * - Ping/data datagram framing
 */

mod hole_punching;
mod peers;
mod signalling;
mod socket;
mod stun;
mod types;

pub use hole_punching::{decode, encode_data, encode_ping, Packet, HEADER_LEN, MAGIC_DATA, MAGIC_PING};
pub use peers::{PeerEvent, PeerRegistry, PeerTable, PingFn, PROBE_INTERVAL, RENDEZVOUS_KEEPALIVE_INTERVAL, UNKNOWN_PEER};
pub use signalling::{JoinRequest, RENDEZVOUS_PATH};
pub use socket::{Datagram, StunSocket, STUN_KEEPALIVE_INTERVAL};
pub use stun::{is_stun_message, StunEngine, STUN_TIMEOUT};
pub use types::{ClientConfig, ConnectionState, Peer, PeerList};

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;

/// A data message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub from: SocketAddr,
    pub peer: String,
    pub payload: Vec<u8>,
}

/// NAT traversal state machine
pub struct NatTraversal {
    config: ClientConfig,
    state: ConnectionState,
}

impl NatTraversal {
    /// Create a new NAT traversal manager
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
        }
    }

    /// Discover the public endpoint, then join the topic from it
    pub async fn connect(&mut self) -> Result<TraversalSession> {
        match self.run_pipeline().await {
            Ok(session) => {
                self.state = ConnectionState::Connected;
                Ok(session)
            }
            Err(e) => {
                self.state = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_pipeline(&mut self) -> Result<TraversalSession> {
        // Step 1: STUN discovery
        self.state = ConnectionState::StunDiscovery;
        let socket = Arc::new(StunSocket::bind(&self.config.stun_server).await?);

        info!(addr = %socket.local_addr(), "Local address");
        info!(addr = %socket.public_addr(), "Public address");

        // Step 2: Register with the coordination server
        self.state = ConnectionState::Registering;
        let request = JoinRequest {
            base_url: self.config.coordination_url.clone(),
            topic: self.config.topic.clone(),
            name: self.config.name.clone(),
            public_addr: socket.public_addr(),
            accept_invalid_certs: self.config.accept_invalid_certs,
        };

        let registry = match PeerRegistry::connect(&request, ping_sender(socket.clone())).await {
            Ok(registry) => registry,
            Err(e) => {
                socket.close();
                return Err(e);
            }
        };

        Ok(TraversalSession { socket, registry })
    }

    /// Get current connection state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }
}

/// Ping probes leave through the STUN-mapped socket
fn ping_sender(socket: Arc<StunSocket>) -> PingFn {
    Arc::new(move |addr| {
        if let Err(e) = socket.try_send_to(&encode_ping(), addr) {
            debug!(addr = %addr, error = %e, "ping probe not sent");
        }
    })
}

/// A joined topic: shared socket plus peer registry
pub struct TraversalSession {
    socket: Arc<StunSocket>,
    registry: PeerRegistry,
}

impl TraversalSession {
    pub fn socket(&self) -> &StunSocket {
        &self.socket
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Send `payload` to every known peer, punched or not.
    /// Returns how many sends succeeded.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let message = encode_data(payload);
        let mut sent = 0;

        for addr in self.registry.peer_addresses() {
            info!(addr = %addr, peer = %self.registry.resolve_name(addr), "Sending data packet");
            match self.socket.send_to(&message, addr).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(addr = %addr, error = %e, "Failed to send data packet"),
            }
        }

        sent
    }

    /// Next data message from a peer. Pings are consumed along the way and
    /// malformed datagrams dropped. `None` once the socket is closed.
    pub async fn recv(&self) -> Option<Received> {
        loop {
            let datagram = self.socket.read().await?;
            if let Some(received) = self.dispatch(datagram) {
                return Some(received);
            }
        }
    }

    fn dispatch(&self, datagram: Datagram) -> Option<Received> {
        match decode(&datagram.data) {
            Ok(Packet::Ping) => {
                self.registry.on_ping_received(datagram.addr);
                None
            }
            Ok(Packet::Data(payload)) => Some(Received {
                from: datagram.addr,
                peer: self.registry.resolve_name(datagram.addr),
                payload: payload.to_vec(),
            }),
            Err(e) => {
                let peer = self.registry.resolve_name(datagram.addr);
                warn!("[{} aka {}]: {}", datagram.addr, peer, e);
                None
            }
        }
    }

    /// Log every inbound message until the socket closes
    pub async fn run(&self) {
        while let Some(received) = self.recv().await {
            info!(
                "[{} aka {}]: {}",
                received.from,
                received.peer,
                String::from_utf8_lossy(&received.payload)
            );
        }
        debug!("socket closed, receive loop done");
    }

    /// Leave the topic and close the socket
    pub async fn close(&self) {
        self.registry.close().await;
        self.socket.close();
    }
}
