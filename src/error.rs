/**
 * error.rs
 *
 * Error types shared by the client and the coordination server
 */

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Bad URL or address input, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// The public endpoint could not be learned
    #[error("STUN discovery failed: {0}")]
    StunDiscoveryFailed(String),

    /// The rendezvous connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Another client already holds this name in the topic
    #[error("Name '{name}' is already registered in topic '{topic}'")]
    NameConflict { topic: String, name: String },

    /// The coordination server refused the handshake
    #[error("Rejected by coordination server ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// Send/receive failure after startup
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed message; the offending message is dropped
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Datagram decoding failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("data datagram truncated: {0} bytes, header needs 128")]
    Truncated(usize),

    #[error("unknown magic {0:016X}")]
    UnknownMagic(u64),
}

/// Rendezvous handshake parameter failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing {0}")]
    MissingField(&'static str),

    #[error("Missing or invalid ip")]
    InvalidAddress(String),

    #[error("Missing or invalid port")]
    InvalidPort(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
