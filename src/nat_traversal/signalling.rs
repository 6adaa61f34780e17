/**
 * nat_traversal/signalling.rs
 *
 * WebSocket connection to the coordination server (TLS optional,
 * self-signed certs allowed for development)
 */

use std::net::SocketAddr;

use native_tls::TlsConnector;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};

/// Path the coordination server accepts upgrades on
pub const RENDEZVOUS_PATH: &str = "websocket";

pub type SignallingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to join a topic
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Coordination server base URL (http, https, ws or wss)
    pub base_url: String,
    pub topic: String,
    pub name: String,
    /// Our public endpoint, as learned through STUN
    pub public_addr: SocketAddr,
    pub accept_invalid_certs: bool,
}

impl JoinRequest {
    /// Upgrade URL carrying the registration as query parameters
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Unable to parse base url '{}': {}", self.base_url, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::Config(format!("Unsupported coordination server scheme '{}'", other)));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config(format!("Cannot use scheme '{}' for '{}'", scheme, self.base_url)))?;

        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("'{}' cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .push(RENDEZVOUS_PATH);

        url.query_pairs_mut()
            .append_pair("topic", &self.topic)
            .append_pair("name", &self.name)
            .append_pair("ip", &self.public_addr.ip().to_string())
            .append_pair("port", &self.public_addr.port().to_string());

        Ok(url)
    }
}

/// Open the rendezvous connection. A refused handshake surfaces as
/// [`Error::NameConflict`] or [`Error::Rejected`].
pub async fn connect(request: &JoinRequest) -> Result<SignallingStream> {
    let url = request.url()?;

    let connector = if url.scheme() == "wss" {
        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(request.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build TLS connector: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    match connect_async_tls_with_config(url.as_str(), None, false, connector).await {
        Ok((ws_stream, _resp)) => Ok(ws_stream),
        Err(WsError::Http(response)) => {
            let status = response.status().as_u16();
            if status == 401 {
                return Err(Error::NameConflict {
                    topic: request.topic.clone(),
                    name: request.name.clone(),
                });
            }

            let reason = response
                .body()
                .as_deref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .unwrap_or_default();
            Err(Error::Rejected { status, reason })
        }
        Err(e) => Err(Error::Connect(format!("Unable to establish websocket connection: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(base_url: &str) -> JoinRequest {
        JoinRequest {
            base_url: base_url.to_string(),
            topic: "t".to_string(),
            name: "alice".to_string(),
            public_addr: "203.0.113.5:40000".parse().unwrap(),
            accept_invalid_certs: false,
        }
    }

    #[test]
    fn test_http_becomes_ws() {
        let url = request("http://coord.example").url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://coord.example/websocket?topic=t&name=alice&ip=203.0.113.5&port=40000"
        );
    }

    #[test]
    fn test_https_keeps_base_path() {
        let url = request("https://coord.example/rdv/").url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/rdv/websocket");
    }

    #[test]
    fn test_ws_untouched() {
        let url = request("ws://127.0.0.1:6969").url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(6969));
        assert_eq!(url.path(), "/websocket");
    }

    #[test]
    fn test_names_are_escaped() {
        let mut req = request("http://coord.example");
        req.name = "bob & co".to_string();
        let url = req.url().unwrap();

        let name = url
            .query_pairs()
            .find(|(k, _)| k == "name")
            .map(|(_, v)| v.into_owned());
        assert_eq!(name.as_deref(), Some("bob & co"));
    }

    #[test]
    fn test_bad_base_url() {
        assert!(matches!(request("not a url").url(), Err(Error::Config(_))));
        assert!(matches!(request("ftp://coord.example").url(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&request(&format!("http://{}", addr))).await;
        assert!(matches!(result, Err(Error::Connect(_))));
    }
}
