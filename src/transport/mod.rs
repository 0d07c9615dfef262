/*
 * mod.rs
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

//! Key-addressed stream transport over the routing fabric. One TLS session
//! per remote key, multiplexed; `dial` reuses a live session, concurrent
//! dials to the same key share one in-flight attempt, and an inbound
//! session replaces whatever it collides with. Streams handed out by the
//! listener carry the cryptographically verified remote key.

pub mod fabric;
pub mod mux;
pub mod tls;

pub use fabric::{Fabric, FabricStream, TcpFabric};
pub use mux::{MuxConnection, MuxStream, Role};
pub use tls::TlsIdentity;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Dial and handshake must settle inside this window.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A stream to an authenticated peer; SMTP is spoken over this.
pub struct Stream {
    inner: MuxStream,
    remote: String,
}

impl Stream {
    /// Hex public key of the peer at the far end, proven by the TLS layer.
    pub fn remote_key(&self) -> &str {
        &self.remote
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("remote", &self.remote).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One authenticated, multiplexed session to a remote key.
struct Session {
    remote: String,
    mux: MuxConnection,
}

impl Session {
    fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn close(&self, reason: &str) {
        self.mux.close(reason);
    }
}

type DialResult = Result<Arc<Session>, String>;

struct PendingDial {
    tx: watch::Sender<Option<DialResult>>,
    rx: watch::Receiver<Option<DialResult>>,
    cancel: CancellationToken,
}

struct TransportInner {
    config: Config,
    identity: TlsIdentity,
    fabric: Arc<dyn Fabric>,
    acceptor: TlsAcceptor,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    pending: Mutex<HashMap<String, PendingDial>>,
    inbound_tx: mpsc::Sender<Stream>,
    shutdown: CancellationToken,
}

/// The transport handle: `dial` for the sender, plus a listener of inbound
/// streams for the overlay SMTP face.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

/// Accept-loop surface: yields inbound streams with their remote identity.
pub struct TransportListener {
    rx: mpsc::Receiver<Stream>,
}

impl TransportListener {
    /// Next inbound stream; None once the transport has shut down.
    pub async fn accept(&mut self) -> Option<Stream> {
        self.rx.recv().await
    }
}

impl Transport {
    pub fn new(
        config: Config,
        fabric: Arc<dyn Fabric>,
    ) -> Result<(Self, TransportListener), TransportError> {
        let identity = TlsIdentity::new(&config)?;
        let acceptor = TlsAcceptor::from(Arc::new(identity.server_config()?));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let inner = Arc::new(TransportInner {
            config,
            identity,
            fabric,
            acceptor,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            inbound_tx,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(inner.clone()));
        Ok((Self { inner }, TransportListener { rx: inbound_rx }))
    }

    /// Open a stream to the node holding `host` (a hex public key),
    /// reusing a live session when one exists. The single space written
    /// after open makes the far side's accept fire.
    pub async fn dial(&self, host: &str) -> Result<Stream, TransportError> {
        for _ in 0..3 {
            let session = self.session_for(host).await?;
            match session.mux.open_stream().await {
                Ok(mut stream) => {
                    stream.write_all(b" ").await?;
                    stream.flush().await?;
                    return Ok(Stream {
                        inner: stream,
                        remote: session.remote.clone(),
                    });
                }
                Err(e) => {
                    // The cached session died under us; evict and retry.
                    evict_session(&self.inner, &session);
                    if !session.is_closed() {
                        return Err(TransportError::from(e));
                    }
                }
            }
        }
        Err(TransportError::new(format!("session to {} keeps closing", host)))
    }

    /// Close every session and stop the accept loop. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.inner.sessions.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close("shutting down");
        }
        let mut pending = self.inner.pending.lock().unwrap();
        for (_, p) in pending.drain() {
            p.cancel.cancel();
            let _ = p.tx.send(Some(Err("transport shutting down".to_string())));
        }
    }

    /// A live session to `host`: cached, shared in-flight dial, or fresh.
    async fn session_for(&self, host: &str) -> Result<Arc<Session>, TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::new("transport is shut down"));
        }
        {
            let sessions = self.inner.sessions.lock().unwrap();
            if let Some(session) = sessions.get(host) {
                if !session.is_closed() {
                    return Ok(session.clone());
                }
            }
        }

        // One dial in flight per destination; everyone else waits on it.
        let rx = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.get(host) {
                Some(p) => p.rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let cancel = CancellationToken::new();
                    pending.insert(
                        host.to_string(),
                        PendingDial {
                            tx,
                            rx: rx.clone(),
                            cancel: cancel.clone(),
                        },
                    );
                    tokio::spawn(dial_task(self.inner.clone(), host.to_string(), cancel));
                    rx
                }
            }
        };

        wait_for_dial(rx).await
    }
}

async fn wait_for_dial(
    mut rx: watch::Receiver<Option<DialResult>>,
) -> Result<Arc<Session>, TransportError> {
    loop {
        let settled = rx.borrow().clone();
        if let Some(result) = settled {
            return result.map_err(TransportError::new);
        }
        if rx.changed().await.is_err() {
            return Err(TransportError::new("dial abandoned"));
        }
    }
}

/// Run one dial to completion and publish the outcome to all waiters. If
/// an inbound session for the same host arrived meanwhile, the pending
/// entry is already gone and the fresh session is discarded.
async fn dial_task(inner: Arc<TransportInner>, host: String, cancel: CancellationToken) {
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        r = tokio::time::timeout(DIAL_TIMEOUT, open_session(&inner, &host)) => match r {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(format!("dial to {} timed out", host))),
        },
    };

    let mut pending = inner.pending.lock().unwrap();
    match pending.remove(&host) {
        Some(p) => {
            let final_result: DialResult = match result {
                Ok(session) => {
                    let mut sessions = inner.sessions.lock().unwrap();
                    match sessions.get(&host) {
                        Some(existing) if !existing.is_closed() => {
                            // Someone beat us to it; use theirs.
                            session.close("replaced");
                            Ok(existing.clone())
                        }
                        _ => {
                            sessions.insert(host.clone(), session.clone());
                            Ok(session)
                        }
                    }
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = p.tx.send(Some(final_result));
        }
        None => {
            if let Ok(session) = result {
                session.close("replaced");
            }
        }
    }
}

/// Fabric connect plus TLS handshake pinned to the destination key.
async fn open_session(
    inner: &Arc<TransportInner>,
    host: &str,
) -> Result<Arc<Session>, TransportError> {
    let key = decode_host(host)?;
    let verifying = VerifyingKey::from_bytes(&key)
        .map_err(|_| TransportError::new(format!("{} is not a valid public key", host)))?;

    let pipe = inner.fabric.connect(&key).await?;
    let connector = TlsConnector::from(Arc::new(inner.identity.client_config(verifying)?));
    let server_name = tls::dial_server_name(host)?;
    let tls_stream = connector
        .connect(server_name, pipe)
        .await
        .map_err(|e| TransportError::new(format!("handshake with {} failed: {}", host, e)))?;

    let (mux, accept_rx) = MuxConnection::new(tls_stream, Role::Dialer);
    let session = Arc::new(Session {
        remote: host.to_string(),
        mux,
    });
    attach_session(inner, &session, accept_rx);
    tracing::debug!("dialed session to {}", host);
    Ok(session)
}

fn decode_host(host: &str) -> Result<[u8; 32], TransportError> {
    let bytes = hex::decode(host)
        .map_err(|_| TransportError::new(format!("{} is not a valid public key", host)))?;
    bytes[..]
        .try_into()
        .map_err(|_| TransportError::new(format!("{} is not a valid public key", host)))
}

/// Accept fabric pipes, authenticate them, and install the sessions.
async fn accept_loop(inner: Arc<TransportInner>) {
    loop {
        let pipe = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            accepted = inner.fabric.accept() => match accepted {
                Ok(pipe) => pipe,
                Err(e) => {
                    tracing::warn!("fabric accept failed: {}", e);
                    return;
                }
            },
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_inbound(inner, pipe).await {
                tracing::debug!("inbound session rejected: {}", e);
            }
        });
    }
}

async fn handle_inbound(
    inner: Arc<TransportInner>,
    pipe: FabricStream,
) -> Result<(), TransportError> {
    let tls_stream = tokio::time::timeout(DIAL_TIMEOUT, inner.acceptor.accept(pipe))
        .await
        .map_err(|_| TransportError::new("inbound handshake timed out"))?
        .map_err(|e| TransportError::new(format!("inbound handshake failed: {}", e)))?;

    // The client certificate was verified during the handshake; its key is
    // the session's identity.
    let remote = {
        let (_, connection) = tls_stream.get_ref();
        let certs = connection
            .peer_certificates()
            .ok_or_else(|| TransportError::new("peer sent no certificate"))?;
        let cert = certs
            .first()
            .ok_or_else(|| TransportError::new("peer sent no certificate"))?;
        let key = tls::certificate_public_key(cert)
            .map_err(|e| TransportError::new(format!("peer certificate: {}", e)))?;
        hex::encode(key.to_bytes())
    };

    if remote == inner.config.public_key_hex() {
        return Err(TransportError::new("refusing session with ourselves"));
    }

    let (mux, accept_rx) = MuxConnection::new(tls_stream, Role::Acceptor);
    let session = Arc::new(Session {
        remote: remote.clone(),
        mux,
    });

    // Collision policy: the newer inbound session wins; the older cached
    // session is closed, and any dial in flight is handed this session.
    let old = {
        let mut sessions = inner.sessions.lock().unwrap();
        sessions.insert(remote.clone(), session.clone())
    };
    if let Some(old) = old {
        old.close("replaced");
    }
    {
        let mut pending = inner.pending.lock().unwrap();
        if let Some(p) = pending.remove(&remote) {
            p.cancel.cancel();
            let _ = p.tx.send(Some(Ok(session.clone())));
        }
    }

    attach_session(&inner, &session, accept_rx);
    tracing::debug!("accepted session from {}", remote);
    Ok(())
}

/// Start the per-session tasks: forward peer-opened streams to the
/// listener (consuming the kick byte first), and evict the session from
/// the cache when it closes.
fn attach_session(
    inner: &Arc<TransportInner>,
    session: &Arc<Session>,
    mut accept_rx: mpsc::Receiver<MuxStream>,
) {
    let forward_inner = inner.clone();
    let remote = session.remote.clone();
    tokio::spawn(async move {
        while let Some(mut stream) = accept_rx.recv().await {
            let inbound_tx = forward_inner.inbound_tx.clone();
            let remote = remote.clone();
            tokio::spawn(async move {
                // The dialer kicks each stream with one space byte so that
                // it surfaces here; it is not part of the dialogue.
                let mut kick = [0u8; 1];
                match tokio::time::timeout(DIAL_TIMEOUT, stream.read_exact(&mut kick)).await {
                    Ok(Ok(_)) => {
                        let _ = inbound_tx
                            .send(Stream {
                                inner: stream,
                                remote,
                            })
                            .await;
                    }
                    _ => {
                        tracing::debug!("inbound stream from {} never spoke", remote);
                    }
                }
            });
        }
    });

    let evict_inner = inner.clone();
    let session = session.clone();
    tokio::spawn(async move {
        session.mux.closed().await;
        evict_session(&evict_inner, &session);
    });
}

fn evict_session(inner: &Arc<TransportInner>, session: &Arc<Session>) {
    let mut sessions = inner.sessions.lock().unwrap();
    if let Some(current) = sessions.get(&session.remote) {
        if Arc::ptr_eq(current, session) {
            sessions.remove(&session.remote);
        }
    }
}
