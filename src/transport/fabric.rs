/*
 * fabric.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * This file is part of Yggmail, a peer-to-peer mail server.
 *
 * Yggmail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Yggmail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Yggmail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The routing fabric the transport is layered on: something that can hand
//! us a reliable byte pipe to the node holding a given public key, and
//! accept pipes from other nodes. The fabric routes; it does not
//! authenticate. Whatever identity a fabric peer claims is only a routing
//! hint, and the TLS layer above decides whether to believe it.
//!
//! `TcpFabric` is the in-tree single-hop implementation: static peer URIs
//! dialed at startup, optional LAN discovery over a multicast beacon, and a
//! learned table from public key to socket address.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait FabricIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> FabricIo for T {}

/// A reliable, ordered, unauthenticated byte pipe to one fabric peer.
pub type FabricStream = Box<dyn FabricIo>;

/// The surface the transport consumes.
pub trait Fabric: Send + Sync + 'static {
    /// Open a pipe towards the node claiming `key`.
    fn connect<'a>(&'a self, key: &'a [u8; 32]) -> BoxFuture<'a, io::Result<FabricStream>>;

    /// Wait for a pipe opened by some other node.
    fn accept<'a>(&'a self) -> BoxFuture<'a, io::Result<FabricStream>>;
}

const HELLO_MAGIC: &[u8; 4] = b"YGMF";
const HELLO_VERSION: u8 = 1;
const HELLO_LENGTH: usize = 4 + 1 + 32 + 2;
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

const BEACON_MAGIC: &[u8; 4] = b"YGMB";
const BEACON_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 224);
const BEACON_PORT: u16 = 41987;
const BEACON_INTERVAL: Duration = Duration::from_secs(15);

const PEER_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Single-hop TCP fabric with a learned peer table.
pub struct TcpFabric {
    local_key: [u8; 32],
    listener: TcpListener,
    listen_port: u16,
    peers: Mutex<HashMap<[u8; 32], SocketAddr>>,
}

impl TcpFabric {
    /// Bind the fabric listener and start peer discovery: one probe task
    /// per static peer URI, plus the multicast beacon when enabled.
    pub async fn bind(
        local_key: [u8; 32],
        static_peers: &[String],
        multicast: bool,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let listen_port = listener.local_addr()?.port();
        let fabric = Arc::new(Self {
            local_key,
            listener,
            listen_port,
            peers: Mutex::new(HashMap::new()),
        });

        for peer in static_peers {
            let addr = parse_peer_uri(peer)?;
            let fabric = fabric.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = fabric.probe_peer(addr).await {
                        tracing::debug!("peer probe {} failed: {}", addr, e);
                    }
                    tokio::time::sleep(PEER_PROBE_INTERVAL).await;
                }
            });
        }

        if multicast {
            match bind_beacon_socket().await {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    tokio::spawn(beacon_send_task(socket.clone(), local_key, listen_port));
                    tokio::spawn(beacon_recv_task(socket, fabric.clone()));
                }
                Err(e) => {
                    tracing::warn!("multicast discovery unavailable: {}", e);
                }
            }
        }

        Ok(fabric)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Current route for a key, if any.
    pub fn route_for(&self, key: &[u8; 32]) -> Option<SocketAddr> {
        self.peers.lock().unwrap().get(key).copied()
    }

    fn record_peer(&self, key: [u8; 32], addr: SocketAddr) {
        if key == self.local_key {
            return;
        }
        self.peers.lock().unwrap().insert(key, addr);
    }

    /// Dial a peer address just to learn which key lives there.
    async fn probe_peer(&self, addr: SocketAddr) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        let (key, _port) = exchange_hello(&mut stream, self.local_key, self.listen_port).await?;
        self.record_peer(key, addr);
        tracing::debug!("fabric peer {} is {}", addr, hex::encode(key));
        Ok(())
    }
}

impl Fabric for TcpFabric {
    fn connect<'a>(&'a self, key: &'a [u8; 32]) -> BoxFuture<'a, io::Result<FabricStream>> {
        Box::pin(async move {
            let addr = self.route_for(key).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no route to destination")
            })?;
            let mut stream = TcpStream::connect(addr).await?;
            let (claimed, _port) =
                exchange_hello(&mut stream, self.local_key, self.listen_port).await?;
            if &claimed != key {
                // The table was stale; drop the route and report no route.
                self.peers.lock().unwrap().remove(key);
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "destination moved, route dropped",
                ));
            }
            Ok(Box::new(stream) as FabricStream)
        })
    }

    fn accept<'a>(&'a self) -> BoxFuture<'a, io::Result<FabricStream>> {
        Box::pin(async move {
            loop {
                let (mut stream, addr) = self.listener.accept().await?;
                match exchange_hello(&mut stream, self.local_key, self.listen_port).await {
                    Ok((key, port)) => {
                        self.record_peer(key, SocketAddr::new(addr.ip(), port));
                        return Ok(Box::new(stream) as FabricStream);
                    }
                    Err(e) => {
                        tracing::debug!("fabric hello from {} failed: {}", addr, e);
                        continue;
                    }
                }
            }
        })
    }
}

/// Swap hellos: magic, version, our key, our listener port. Returns the
/// peer's claimed key and advertised port.
async fn exchange_hello(
    stream: &mut TcpStream,
    local_key: [u8; 32],
    listen_port: u16,
) -> io::Result<([u8; 32], u16)> {
    let mut ours = Vec::with_capacity(HELLO_LENGTH);
    ours.extend_from_slice(HELLO_MAGIC);
    ours.push(HELLO_VERSION);
    ours.extend_from_slice(&local_key);
    ours.extend_from_slice(&listen_port.to_be_bytes());

    tokio::time::timeout(HELLO_TIMEOUT, async {
        stream.write_all(&ours).await?;
        stream.flush().await?;
        let mut theirs = [0u8; HELLO_LENGTH];
        stream.read_exact(&mut theirs).await?;
        if &theirs[..4] != HELLO_MAGIC || theirs[4] != HELLO_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a yggmail fabric peer",
            ));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&theirs[5..37]);
        let port = u16::from_be_bytes([theirs[37], theirs[38]]);
        Ok((key, port))
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "fabric hello timed out"))?
}

/// `tcp://host:port` or plain `host:port`.
fn parse_peer_uri(uri: &str) -> io::Result<SocketAddr> {
    let hostport = uri.strip_prefix("tcp://").unwrap_or(uri);
    hostport.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid peer URI {:?}", uri),
        )
    })
}

async fn bind_beacon_socket() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", BEACON_PORT)).await?;
    socket.join_multicast_v4(BEACON_GROUP, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

async fn beacon_send_task(socket: Arc<UdpSocket>, local_key: [u8; 32], listen_port: u16) {
    let mut beacon = Vec::with_capacity(4 + 32 + 2);
    beacon.extend_from_slice(BEACON_MAGIC);
    beacon.extend_from_slice(&local_key);
    beacon.extend_from_slice(&listen_port.to_be_bytes());
    loop {
        if let Err(e) = socket.send_to(&beacon, (BEACON_GROUP, BEACON_PORT)).await {
            tracing::debug!("beacon send failed: {}", e);
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn beacon_recv_task(socket: Arc<UdpSocket>, fabric: Arc<TcpFabric>) {
    let mut buf = [0u8; 64];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        if n != 4 + 32 + 2 || &buf[..4] != BEACON_MAGIC {
            continue;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[4..36]);
        let port = u16::from_be_bytes([buf[36], buf[37]]);
        fabric.record_peer(key, SocketAddr::new(from.ip(), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_uri_forms() {
        assert!(parse_peer_uri("tcp://127.0.0.1:1234").is_ok());
        assert!(parse_peer_uri("127.0.0.1:1234").is_ok());
        assert!(parse_peer_uri("nonsense").is_err());
    }

    #[tokio::test]
    async fn hello_and_connect_round_trip() {
        let a = TcpFabric::bind([0xaa; 32], &[], false).await.unwrap();
        let b = TcpFabric::bind([0xbb; 32], &[], false).await.unwrap();

        // B must be accepting for hellos to complete: the first accepted
        // pipe is A's probe, the second is the real connect.
        let b_acceptor = b.clone();
        let accept_task = tokio::spawn(async move {
            let _probe = b_acceptor.accept().await.unwrap();
            b_acceptor.accept().await
        });

        // Teach A where B lives.
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.listen_port()).parse().unwrap();
        a.probe_peer(b_addr).await.unwrap();
        assert_eq!(a.route_for(&[0xbb; 32]), Some(b_addr));

        let mut dialed = a.connect(&[0xbb; 32]).await.unwrap();
        dialed.write_all(b"ping").await.unwrap();

        let mut accepted = accept_task.await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // B learned A's route from the hello.
        assert!(b.route_for(&[0xaa; 32]).is_some());
    }
}
