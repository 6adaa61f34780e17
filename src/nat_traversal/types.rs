/**
 * nat_traversal/types.rs
 *
 * Core types shared by the rendezvous client and the coordination server
 */

use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A topic member as published by the coordination server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,

    #[serde(with = "ip_text")]
    pub ip: IpAddr,

    pub port: u16,

    #[serde(with = "epoch_millis")]
    pub last_seen: SystemTime,
}

impl Peer {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            ip: addr.ip().to_canonical(),
            port: addr.port(),
            last_seen: SystemTime::now(),
        }
    }

    /// Traversal identity of the peer
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Message pushed to every topic member whenever the topic changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<Peer>,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordination server base URL (http, https, ws or wss)
    pub coordination_url: String,

    /// STUN server address (host:port)
    pub stun_server: String,

    /// Topic to join
    pub topic: String,

    /// Display name, unique within the topic
    pub name: String,

    /// Accept self-signed certificates from the coordination server
    pub accept_invalid_certs: bool,
}

/// Connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    StunDiscovery,
    Registering,
    Connected,
    Failed(String),
}

/// IPs travel as text; IPv4-mapped IPv6 is folded back to IPv4 so it
/// compares equal to the sender address of a UDP datagram.
mod ip_text {
    use std::net::IpAddr;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ip: &IpAddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(ip)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IpAddr, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<IpAddr>()
            .map(|ip| ip.to_canonical())
            .map_err(|_| D::Error::custom(format!("Malformed IP address '{}'", raw)))
    }
}

/// Timestamps travel as signed milliseconds since the Unix epoch
mod epoch_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };
        serializer.serialize_i64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        let offset = Duration::from_millis(millis.unsigned_abs());
        Ok(if millis >= 0 {
            UNIX_EPOCH + offset
        } else {
            UNIX_EPOCH - offset
        })
    }
}
