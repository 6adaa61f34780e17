//! Loopback fixtures: a coordination server and a STUN responder

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use punchline::coord::{CoordConfig, CoordServer, Topics};
use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Start a coordination server on an ephemeral loopback port
pub async fn coord_server() -> (SocketAddr, Arc<Topics>) {
    let config = CoordConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
    };
    let server = CoordServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let topics = server.topics();

    tokio::spawn(server.run());

    (addr, topics)
}

/// STUN server that answers every binding request with the sender address
pub async fn stun_responder() -> SocketAddr {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = server.recv_from(&mut buf).await {
            if len < 20 {
                continue;
            }
            let mut id = [0u8; 12];
            id.copy_from_slice(&buf[8..20]);
            let _ = server.send_to(&binding_success(&id, from), from).await;
        }
    });

    addr
}

fn binding_success(id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("loopback STUN responder is IPv4 only");
    };

    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(&0x0101u16.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(id);
    msg.extend_from_slice(&0x0020u16.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.extend_from_slice(&[0x00, 0x01]);
    msg.extend_from_slice(&(v4.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    msg.extend_from_slice(&(u32::from(*v4.ip()) ^ MAGIC_COOKIE).to_be_bytes());
    msg
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached in time");
}
