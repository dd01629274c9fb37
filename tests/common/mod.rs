#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tftp_engine::options::OptionPairs;
use tftp_engine::{Client, ClientOptions, FileMode, Packet, RetryPolicy, Server, ServerConfig};
use tokio::net::UdpSocket;

pub fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        response_timeout: Duration::from_millis(200),
        max_retries: 3,
        idle_session_timeout: Duration::from_secs(5),
    }
}

pub fn quick_config() -> ServerConfig {
    ServerConfig { policy: quick_policy(), ..ServerConfig::default() }
}

pub fn start_server(root: &Path, config: ServerConfig) -> (Server, SocketAddr) {
    let mut server = Server::new(root, config);
    let addr = server.listen(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
    (server, addr)
}

pub fn quick_client(server: SocketAddr) -> Client {
    Client::new(server, ClientOptions { policy: quick_policy(), ..ClientOptions::default() })
}

/// Contents that make misplaced blocks obvious.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn rrq(path: &str, options: OptionPairs) -> Packet {
    Packet::ReadReq { path: path.to_string(), mode: FileMode::Octet, options }
}

pub fn wrq(path: &str, options: OptionPairs) -> Packet {
    Packet::WriteReq { path: path.to_string(), mode: FileMode::Octet, options }
}

pub fn pairs(list: &[(&str, &str)]) -> OptionPairs {
    list.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
}

/// A hand-driven TFTP peer for checking exactly what goes over the wire.
pub struct RawPeer {
    pub sock: UdpSocket,
}

impl RawPeer {
    pub async fn bind() -> RawPeer {
        RawPeer { sock: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap() }
    }

    pub fn addr(&self) -> SocketAddr {
        self.sock.local_addr().unwrap()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) {
        self.sock.send_to(&packet.to_bytes(), dst).await.unwrap();
    }

    pub async fn recv(&self) -> (Packet, SocketAddr) {
        let mut buf = vec![0; 70000];
        let (n, src) = tokio::time::timeout(Duration::from_secs(5), self.sock.recv_from(&mut buf))
            .await
            .expect("peer went quiet")
            .unwrap();
        (Packet::parse_from_buf(&buf[..n]).unwrap(), src)
    }

    /// Panics if anything arrives within `window`.
    pub async fn expect_silence(&self, window: Duration) {
        let mut buf = vec![0; 70000];
        if let Ok(Ok((n, src))) = tokio::time::timeout(window, self.sock.recv_from(&mut buf)).await {
            panic!("unexpected {:?} from {}", Packet::parse_from_buf(&buf[..n]), src);
        }
    }
}
