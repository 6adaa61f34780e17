/**
 * nat_traversal/stun.rs
 *
 * STUN binding codec and a small transaction engine.
 * The engine never touches a socket: requests go out through a channel,
 * responses are fed back in by whoever owns the socket.
 */

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const HEADER_LEN: usize = 20;

/// How long a binding transaction may stay unanswered
pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);

pub type TransactionId = [u8; 12];

/// Build a STUN binding request
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut request = Vec::with_capacity(HEADER_LEN);

    // Message type (16 bits)
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits) - no attributes
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    request
}

/// Whether a datagram is a STUN message rather than application traffic
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }

    // The two most significant bits of every STUN message are zero
    if data[0] & 0xC0 != 0 {
        return false;
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;

    magic == STUN_MAGIC_COOKIE && msg_len % 4 == 0 && HEADER_LEN + msg_len == data.len()
}

/// Transaction ID of a STUN message
pub fn transaction_id(data: &[u8]) -> Option<TransactionId> {
    let mut id = [0u8; 12];
    id.copy_from_slice(data.get(8..HEADER_LEN)?);
    Some(id)
}

/// Parse a STUN binding response into the mapped address it reports
pub fn parse_binding_response(data: &[u8], expected_transaction_id: &TransactionId) -> Result<SocketAddr> {
    if data.len() < HEADER_LEN {
        return Err(stun_error("STUN response too short"));
    }

    // Check message type
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type == STUN_BINDING_ERROR {
        return Err(stun_error("STUN server answered with a binding error"));
    }
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(stun_error(format!("Invalid STUN response type: 0x{:04x}", msg_type)));
    }

    // Check magic cookie
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(stun_error("Invalid magic cookie"));
    }

    // Check transaction ID
    if &data[8..HEADER_LEN] != expected_transaction_id {
        return Err(stun_error("Transaction ID mismatch"));
    }

    // Parse message length
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < HEADER_LEN + msg_len {
        return Err(stun_error("STUN response truncated"));
    }

    // Parse attributes
    let mut offset = HEADER_LEN;
    while offset < HEADER_LEN + msg_len {
        if offset + 4 > data.len() {
            break;
        }

        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }

        let attr_data = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return parse_xor_mapped_address(attr_data, expected_transaction_id);
        } else if attr_type == ATTR_MAPPED_ADDRESS {
            return parse_mapped_address(attr_data);
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    Err(stun_error("No address attribute found in STUN response"))
}

/// Parse XOR-MAPPED-ADDRESS attribute
fn parse_xor_mapped_address(data: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(stun_error("XOR-MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let xor_port = u16::from_be_bytes([data[2], data[3]]);
    let port = xor_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            IpAddr::from((xor_addr ^ STUN_MAGIC_COOKIE).to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(stun_error("Invalid IPv6 address length"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            // XOR with magic cookie + transaction ID
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);

            for (byte, key) in addr_bytes.iter_mut().zip(xor_key) {
                *byte ^= key;
            }

            IpAddr::from(addr_bytes)
        }
        _ => return Err(stun_error(format!("Unknown address family: {}", family))),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Parse MAPPED-ADDRESS attribute (fallback)
fn parse_mapped_address(data: &[u8]) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(stun_error("MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);

    let ip = match family {
        0x01 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        0x02 => {
            if data.len() < 20 {
                return Err(stun_error("Invalid IPv6 address length"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(addr_bytes)
        }
        _ => return Err(stun_error(format!("Unknown address family: {}", family))),
    };

    Ok(SocketAddr::new(ip, port))
}

fn stun_error(message: impl Into<String>) -> Error {
    Error::StunDiscoveryFailed(message.into())
}

/// STUN transaction engine
///
/// Outbound requests are written to the channel returned by [`StunEngine::new`];
/// inbound STUN datagrams are handed to [`StunEngine::handle_inbound`].
pub struct StunEngine {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<Vec<u8>>>>,
    timeout: Duration,
}

impl StunEngine {
    /// Create an engine and the receiving end of its outbound queue
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::channel(16);

        let engine = Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            timeout,
        };

        (engine, outbound_rx)
    }

    /// Route a STUN datagram to the transaction waiting for it.
    /// Unsolicited or late responses are dropped.
    pub fn handle_inbound(&self, data: &[u8]) {
        let Some(id) = transaction_id(data) else {
            return;
        };

        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if let Some(waiter) = waiter {
            let _ = waiter.send(data.to_vec());
        }
    }

    /// Run one binding transaction and return the mapped address
    pub async fn binding_request(&self) -> Result<SocketAddr> {
        let id: TransactionId = rand::random();
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let outcome = self.transact(&id, rx).await;

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        outcome
    }

    async fn transact(&self, id: &TransactionId, rx: oneshot::Receiver<Vec<u8>>) -> Result<SocketAddr> {
        self.outbound
            .send(build_binding_request(id))
            .await
            .map_err(|_| stun_error("STUN engine is closed"))?;

        let response = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| stun_error("STUN request timed out"))?
            .map_err(|_| stun_error("STUN engine is closed"))?;

        parse_binding_response(&response, id)
    }
}

/// Binding success response carrying `addr` as XOR-MAPPED-ADDRESS
#[cfg(test)]
pub(crate) fn xor_mapped_response(id: &TransactionId, addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("test helper only encodes IPv4");
    };

    let mut msg = Vec::new();
    msg.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(id);
    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.push(0);
    msg.push(0x01);
    msg.extend_from_slice(&(v4.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    msg.extend_from_slice(&(u32::from(*v4.ip()) ^ STUN_MAGIC_COOKIE).to_be_bytes());
    msg
}
