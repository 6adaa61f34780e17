/**
 * coord/mod.rs
 *
 * Coordination server: topic directory plus one WebSocket rendezvous
 * session per client
 */

mod session;
mod topic;

pub use session::JoinParams;
pub use topic::{ChangeSignal, Topic, Topics};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 6969;

/// Coordination server configuration
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub listen_addr: SocketAddr,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
        }
    }
}

/// Listening coordination server
pub struct CoordServer {
    listener: TcpListener,
    topics: Arc<Topics>,
}

impl CoordServer {
    pub async fn bind(config: &CoordConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot listen on {}: {}", config.listen_addr, e)))?;

        Ok(Self {
            listener,
            topics: Arc::new(Topics::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared topic directory, for inspection
    pub fn topics(&self) -> Arc<Topics> {
        self.topics.clone()
    }

    /// Accept clients until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Listening on");

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            debug!(remote = %remote, "connection accepted");
            tokio::spawn(session::handle_connection(self.topics.clone(), stream, remote));
        }
    }
}
