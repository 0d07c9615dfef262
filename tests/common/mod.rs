/*
 * mod.rs
 * Copyright (C) 2026 Yggmail developers
 *
 * Shared test plumbing: an in-memory routing fabric wired with duplex
 * pipes, unique temporary database paths, and small line-protocol helpers
 * for driving the SMTP and IMAP listeners over real sockets.
 */

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use yggmail::config::Config;
use yggmail::storage::Storage;
use yggmail::transport::fabric::{BoxFuture, Fabric, FabricStream};
use yggmail::{Node, NodeOptions};

/// A set of nodes that can reach each other through duplex pipes.
#[derive(Default)]
pub struct MemoryHub {
    members: Mutex<HashMap<[u8; 32], mpsc::Sender<FabricStream>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the hub under a key, getting a fabric endpoint back.
    pub fn join(self: &Arc<Self>, key: [u8; 32]) -> Arc<MemoryFabric> {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        self.members.lock().unwrap().insert(key, accept_tx);
        Arc::new(MemoryFabric {
            hub: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }
}

pub struct MemoryFabric {
    hub: Arc<MemoryHub>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<FabricStream>>,
}

impl Fabric for MemoryFabric {
    fn connect<'a>(&'a self, key: &'a [u8; 32]) -> BoxFuture<'a, io::Result<FabricStream>> {
        Box::pin(async move {
            let target = self
                .hub
                .members
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no route to destination"))?;
            let (ours, theirs) = tokio::io::duplex(256 * 1024);
            target
                .send(Box::new(theirs))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "destination is gone"))?;
            Ok(Box::new(ours) as FabricStream)
        })
    }

    fn accept<'a>(&'a self) -> BoxFuture<'a, io::Result<FabricStream>> {
        Box::pin(async move {
            self.accept_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "hub closed"))
        })
    }
}

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique database path under the system temp directory.
pub fn temp_db(name: &str) -> String {
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("yggmail-test-{}-{}-{}.db", name, std::process::id(), n))
        .to_string_lossy()
        .to_string()
}

/// Create the node's identity up front so it can join the hub, then start
/// the node on OS-assigned loopback ports.
pub async fn start_node(hub: &Arc<MemoryHub>, db: &str) -> Node {
    let storage = Storage::open(db).await.expect("open database");
    let (config, _) = Config::load_or_create(&storage).await.expect("identity");
    let key = config.public_key_bytes();
    drop(storage);

    let options = NodeOptions {
        database: db.to_string(),
        smtp: "127.0.0.1:0".to_string(),
        imap: "127.0.0.1:0".to_string(),
        peers: Vec::new(),
        multicast: false,
    };
    Node::start_with_fabric(options, hub.join(key))
        .await
        .expect("start node")
}

/// A buffered TCP client for line protocols.
pub struct LineClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\r\n").await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read");
        line.trim_end().to_string()
    }

    /// Read lines until one starts with the given prefix, returning it.
    pub async fn read_until_prefix(&mut self, prefix: &str) -> String {
        loop {
            let line = self.read_line().await;
            if line.starts_with(prefix) {
                return line;
            }
            if line.is_empty() {
                panic!("connection closed while waiting for {:?}", prefix);
            }
        }
    }
}
