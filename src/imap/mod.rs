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

//! IMAP4rev1 server mapping the protocol onto the store, with IDLE, MOVE
//! and a private NOTIFY capability for pushing new-mail announcements.

pub mod command;
pub mod fetch;
pub mod notify;
pub mod session;

pub use notify::{Notify, SessionShared};

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::storage::Storage;

#[derive(Debug)]
pub struct ImapError {
    pub message: String,
}

impl ImapError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for ImapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ImapError {}

impl From<std::io::Error> for ImapError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// The IMAP server's shared state: identity, store and notifier.
pub struct ImapServer {
    pub config: Config,
    pub storage: Storage,
    pub notify: Notify,
}

impl ImapServer {
    pub fn new(config: Config, storage: Storage, notify: Notify) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            notify,
        })
    }

    /// Accept connections until shutdown; one task per session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("IMAP connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(session::run(server, stream));
                }
                Err(e) => {
                    tracing::warn!("IMAP accept failed: {}", e);
                    return;
                }
            }
        }
    }
}
