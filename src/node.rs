/*
 * node.rs
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

//! The long-lived node: store, identity, transport, sender, IMAP listener
//! and both SMTP faces, wired together and torn down as one. Stopping is
//! idempotent and leaves queued deliveries in the store for the next run.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::imap::{ImapServer, Notify};
use crate::sender::Queues;
use crate::smtp::{serve_connection, Backend, BackendMode, SmtpServerConfig};
use crate::storage::Storage;
use crate::transport::{Fabric, TcpFabric, Transport, TransportListener};

#[derive(Debug)]
pub struct NodeError {
    pub message: String,
}

impl NodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<crate::storage::StorageError> for NodeError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<crate::transport::TransportError> for NodeError {
    fn from(e: crate::transport::TransportError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Startup options; the CLI flags map straight onto this.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub database: String,
    pub smtp: String,
    pub imap: String,
    pub peers: Vec<String>,
    pub multicast: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            database: "yggmail.db".to_string(),
            smtp: "localhost:1025".to_string(),
            imap: "localhost:1143".to_string(),
            peers: Vec::new(),
            multicast: false,
        }
    }
}

/// A running node.
pub struct Node {
    config: Config,
    storage: Storage,
    transport: Transport,
    queues: Arc<Queues>,
    shutdown: CancellationToken,
    smtp_addr: SocketAddr,
    imap_addr: SocketAddr,
}

impl Node {
    /// Start on the TCP fabric. At least one of peers/multicast must be
    /// given or the node would be unreachable.
    pub async fn start(options: NodeOptions) -> Result<Node, NodeError> {
        if options.peers.is_empty() && !options.multicast {
            return Err(NodeError::new(
                "specify at least one peer, enable multicast, or both",
            ));
        }
        let storage = Storage::open(&options.database).await?;
        let (config, generated) = Config::load_or_create(&storage).await?;
        if generated {
            tracing::info!("generated new server identity");
        }
        let fabric = TcpFabric::bind(config.public_key_bytes(), &options.peers, options.multicast)
            .await
            .map_err(|e| NodeError::new(format!("fabric startup failed: {}", e)))?;
        Self::start_on(options, storage, config, fabric).await
    }

    /// Start on a caller-supplied fabric; used by tests with an in-memory
    /// fabric and by embedders bringing their own routing layer.
    pub async fn start_with_fabric(
        options: NodeOptions,
        fabric: Arc<dyn Fabric>,
    ) -> Result<Node, NodeError> {
        let storage = Storage::open(&options.database).await?;
        let (config, generated) = Config::load_or_create(&storage).await?;
        if generated {
            tracing::info!("generated new server identity");
        }
        Self::start_on(options, storage, config, fabric).await
    }

    async fn start_on(
        options: NodeOptions,
        storage: Storage,
        config: Config,
        fabric: Arc<dyn Fabric>,
    ) -> Result<Node, NodeError> {
        tracing::info!("using database file {:?}", options.database);
        tracing::info!("mail address: {}", config.mail_address());

        let shutdown = CancellationToken::new();
        let (transport, overlay_listener) = Transport::new(config.clone(), fabric)?;
        let notify = Notify::new();
        let queues = Queues::new(config.clone(), storage.clone(), transport.clone());

        // IMAP
        let imap_listener = TcpListener::bind(&options.imap).await.map_err(|e| {
            NodeError::new(format!("IMAP listener bind on {} failed: {}", options.imap, e))
        })?;
        let imap_addr = imap_listener.local_addr()?;
        let imap_server = ImapServer::new(config.clone(), storage.clone(), notify.clone());
        tokio::spawn(imap_server.serve(imap_listener, shutdown.child_token()));
        tracing::info!("listening for IMAP on {}", imap_addr);

        // SMTP, submission face
        let smtp_listener = TcpListener::bind(&options.smtp).await.map_err(|e| {
            NodeError::new(format!("SMTP listener bind on {} failed: {}", options.smtp, e))
        })?;
        let smtp_addr = smtp_listener.local_addr()?;
        let local_backend = Arc::new(Backend {
            mode: BackendMode::Internal,
            config: config.clone(),
            storage: storage.clone(),
            queues: queues.clone(),
            notify: notify.clone(),
        });
        let local_config = SmtpServerConfig::new(config.public_key_hex(), true);
        tokio::spawn(serve_smtp_local(
            smtp_listener,
            local_backend,
            local_config,
            shutdown.child_token(),
        ));
        tracing::info!("listening for SMTP on {}", smtp_addr);

        // SMTP, overlay face
        let overlay_backend = Arc::new(Backend {
            mode: BackendMode::External,
            config: config.clone(),
            storage: storage.clone(),
            queues: queues.clone(),
            notify: notify.clone(),
        });
        let overlay_config = SmtpServerConfig::new(config.public_key_hex(), false);
        tokio::spawn(serve_smtp_overlay(
            overlay_listener,
            overlay_backend,
            overlay_config,
        ));

        Ok(Node {
            config,
            storage,
            transport,
            queues,
            shutdown,
            smtp_addr,
            imap_addr,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Bound submission address; useful when started on port 0.
    pub fn smtp_addr(&self) -> SocketAddr {
        self.smtp_addr
    }

    pub fn imap_addr(&self) -> SocketAddr {
        self.imap_addr
    }

    /// Stop listeners and sessions. Idempotent; pending queue rows stay in
    /// the store and are retried on the next start.
    pub fn stop(&self) {
        tracing::info!("shutting down");
        self.shutdown.cancel();
        self.queues.shutdown();
        self.transport.shutdown();
    }
}

async fn serve_smtp_local(
    listener: TcpListener,
    backend: Arc<Backend>,
    config: SmtpServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let backend = backend.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let remote = addr.to_string();
                    if let Err(e) = serve_connection(&*backend, &config, stream, &remote).await {
                        tracing::debug!("SMTP session from {} ended: {}", remote, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("SMTP accept failed: {}", e);
                return;
            }
        }
    }
}

async fn serve_smtp_overlay(
    mut listener: TransportListener,
    backend: Arc<Backend>,
    config: SmtpServerConfig,
) {
    while let Some(stream) = listener.accept().await {
        let backend = backend.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let remote = stream.remote_key().to_string();
            if let Err(e) = serve_connection(&*backend, &config, stream, &remote).await {
                tracing::debug!("overlay SMTP session from {} ended: {}", remote, e);
            }
        });
    }
}
