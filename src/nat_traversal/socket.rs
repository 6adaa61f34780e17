/**
 * nat_traversal/socket.rs
 *
 * One UDP socket shared by STUN and peer traffic.
 * The NAT mapping learned through STUN only holds for the socket that
 * asked, so peer datagrams must leave from the very same port.
 */

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::stun::{self, StunEngine, STUN_TIMEOUT};
use crate::error::{Error, Result};

/// Interval between NAT keepalive binding requests
pub const STUN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const INBOUND_QUEUE: usize = 256;
const MAX_DATAGRAM: usize = 65536;

/// A non-STUN datagram and its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub addr: SocketAddr,
}

/// UDP socket with its public mapping discovered through STUN
pub struct StunSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    public_addr: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Datagram>>,
    shutdown: watch::Sender<bool>,
}

impl StunSocket {
    /// Bind an ephemeral IPv4 port and learn its public mapping from `stun_server`
    pub async fn bind(stun_server: &str) -> Result<Self> {
        let server_addr = resolve_ipv4(stun_server).await?;
        let socket = Arc::new(bind_udp()?);
        let local_addr = socket.local_addr()?;

        let (engine, outbound) = StunEngine::new(STUN_TIMEOUT);
        let engine = Arc::new(engine);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown, _) = watch::channel(false);

        tokio::spawn(demultiplex(
            socket.clone(),
            engine.clone(),
            inbound_tx,
            shutdown.subscribe(),
        ));
        tokio::spawn(multiplex(
            socket.clone(),
            outbound,
            server_addr,
            shutdown.subscribe(),
        ));

        let public_addr = match engine.binding_request().await {
            Ok(addr) => addr,
            Err(e) => {
                shutdown.send_replace(true);
                return Err(e);
            }
        };

        debug!(%local_addr, %public_addr, stun = %server_addr, "STUN mapping discovered");

        tokio::spawn(keep_alive(engine, shutdown.subscribe()));

        Ok(Self {
            socket,
            local_addr,
            public_addr,
            inbound: Mutex::new(inbound_rx),
            shutdown,
        })
    }

    /// Locally bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Public address as seen by the STUN server at startup
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Wait for the next non-STUN datagram.
    /// Returns `None` once the socket is closed.
    pub async fn read(&self) -> Option<Datagram> {
        self.inbound.lock().await.recv().await
    }

    /// Send a datagram to a peer
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        self.ensure_open()?;
        self.socket
            .send_to(data, addr)
            .await
            .map_err(|e| Error::Transport(format!("send to {} failed: {}", addr, e)))
    }

    /// Send without waiting; fails if the socket is not writable right now
    pub fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        self.ensure_open()?;
        self.socket
            .try_send_to(data, addr)
            .map_err(|e| Error::Transport(format!("send to {} failed: {}", addr, e)))
    }

    /// Stop the background tasks; pending and future reads end
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("socket is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for StunSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve_ipv4(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .map_err(|e| Error::Config(format!("Unable to resolve STUN server '{}': {}", server, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::Config(format!("No IPv4 address for STUN server '{}'", server)))
}

fn bind_udp() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Split inbound traffic: STUN goes to the engine, the rest to the application queue
async fn demultiplex(
    socket: Arc<UdpSocket>,
    engine: Arc<StunEngine>,
    inbound: mpsc::Sender<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, addr) = match received {
            Ok(received) => received,
            // ICMP unreachable from an earlier send, not a socket failure
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "UDP read failed, closing socket");
                break;
            }
        };

        if stun::is_stun_message(&buf[..len]) {
            engine.handle_inbound(&buf[..len]);
            continue;
        }

        let datagram = Datagram {
            data: buf[..len].to_vec(),
            addr,
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            sent = inbound.send(datagram) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("UDP reader stopped");
}

/// Relay requests produced by the STUN engine to the STUN server
async fn multiplex(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    server_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = outbound.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if let Err(e) = socket.send_to(&request, server_addr).await {
            debug!(error = %e, stun = %server_addr, "failed to send STUN request");
        }
    }
}

/// Best effort NAT keepalive. A failed binding ends the loop and nothing else.
async fn keep_alive(engine: Arc<StunEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STUN_KEEPALIVE_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match engine.binding_request().await {
            Ok(addr) => debug!(public_addr = %addr, "STUN keepalive"),
            Err(e) => {
                debug!(error = %e, "STUN keepalive stopped");
                break;
            }
        }
    }
}
