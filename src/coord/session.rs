/**
 * coord/session.rs
 *
 * One rendezvous session per connected client: validate the upgrade
 * request, register, push peer lists on change, track liveness.
 */

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info};

use super::topic::{ChangeSignal, Topic, Topics};
use crate::error::{Result, ValidationError};
use crate::nat_traversal::{Peer, RENDEZVOUS_PATH};

/// Registration parameters carried in the upgrade request query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub topic: String,
    pub name: String,
    pub addr: SocketAddr,
}

impl JoinParams {
    pub fn from_query(query: Option<&str>) -> std::result::Result<Self, ValidationError> {
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .into_owned()
            .collect();

        // first occurrence wins
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };

        let topic = get("topic");
        if topic.is_empty() {
            return Err(ValidationError::MissingField("topic"));
        }

        let name = get("name");
        if name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }

        let raw_ip = get("ip");
        let ip: IpAddr = raw_ip
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(raw_ip.to_string()))?;

        let raw_port = get("port");
        let port = match raw_port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ValidationError::InvalidPort(raw_port.to_string())),
        };

        Ok(Self {
            topic: topic.to_string(),
            name: name.to_string(),
            addr: SocketAddr::new(ip.to_canonical(), port),
        })
    }
}

/// Topic membership held by a live session; dropping it unregisters
struct Registration {
    topic: Arc<Topic>,
    name: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.topic.unregister(&self.name);
    }
}

#[derive(Serialize)]
struct PeerListView<'a> {
    peers: &'a [Peer],
}

fn reject(status: StatusCode, reason: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.into()));
    *response.status_mut() = status;
    response
}

/// Validate the upgrade request and register the peer
fn admit(topics: &Topics, request: &Request) -> std::result::Result<(Registration, ChangeSignal), ErrorResponse> {
    if request.uri().path().trim_start_matches('/') != RENDEZVOUS_PATH {
        return Err(reject(StatusCode::NOT_FOUND, "Not found"));
    }

    let params = JoinParams::from_query(request.uri().query()).map_err(|e| {
        debug!(error = ?e, "rejected handshake");
        reject(StatusCode::BAD_REQUEST, e.to_string())
    })?;

    let (topic, signal) = topics
        .try_register(&params.topic, &params.name, params.addr)
        .ok_or_else(|| {
            debug!(topic = %params.topic, peer = %params.name, "name already registered");
            reject(StatusCode::UNAUTHORIZED, "Client with that name already exists")
        })?;

    info!(topic = %params.topic, peer = %params.name, addr = %params.addr, "peer registered");

    Ok((
        Registration {
            topic,
            name: params.name,
        },
        signal,
    ))
}

/// Serve one client connection until it closes
pub async fn handle_connection(topics: Arc<Topics>, stream: TcpStream, remote: SocketAddr) {
    let mut admitted = None;

    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        admitted = Some(admit(&topics, request)?);
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!(remote = %remote, error = %e, "handshake failed");
            return;
        }
    };

    let Some((registration, signal)) = admitted else {
        return;
    };

    serve(ws_stream, &registration, signal).await;

    info!(peer = %registration.name, remote = %remote, "peer unregistered");
}

async fn serve(ws_stream: WebSocketStream<TcpStream>, registration: &Registration, signal: ChangeSignal) {
    let (sink, stream) = ws_stream.split();

    // whichever side fails first ends the session
    tokio::select! {
        pushed = push_peer_lists(&registration.topic, signal, sink) => {
            if let Err(e) = pushed {
                debug!(peer = %registration.name, error = %e, "peer list push failed");
            }
        }
        read = watch_liveness(registration, stream) => {
            if let Err(e) = read {
                debug!(peer = %registration.name, error = %e, "connection read failed");
            }
        }
    }
}

/// Send the current list on every change wake
async fn push_peer_lists(
    topic: &Topic,
    mut signal: ChangeSignal,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
) -> Result<()> {
    while signal.changed().await {
        let peers = topic.peer_list();
        let json = serde_json::to_string(&PeerListView { peers: &peers })?;
        sink.send(Message::Text(json)).await?;
    }
    Ok(())
}

/// Discard client messages; transport pings refresh liveness
async fn watch_liveness(registration: &Registration, mut stream: SplitStream<WebSocketStream<TcpStream>>) -> Result<()> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Ping(_) => registration.topic.update_last_seen(&registration.name),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
