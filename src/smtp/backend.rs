/*
 * backend.rs
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

//! The shared SMTP backend: one struct of handles (store, sender, IMAP
//! notifier, identity), immutable after construction, serving both ingress
//! faces. Internal mode authenticates the local user; external mode accepts
//! only anonymous sessions whose identity the transport already proved.

use std::sync::Arc;

use crate::address;
use crate::config::Config;
use crate::imap::Notify;
use crate::sender::Queues;
use crate::smtp::server::{SmtpBackend, SmtpSession};
use crate::smtp::{SessionLocal, SessionRemote, SmtpError};
use crate::storage::Storage;

/// Which face this backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// The loopback submission listener: AUTH required.
    Internal,
    /// The overlay listener: anonymous, peer identity from the transport.
    External,
}

pub struct Backend {
    pub mode: BackendMode,
    pub config: Config,
    pub storage: Storage,
    pub queues: Arc<Queues>,
    pub notify: Notify,
}

/// Session for either face; the server drives both through one type.
pub enum Session {
    Local(SessionLocal),
    Remote(SessionRemote),
}

impl SmtpSession for Session {
    async fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        match self {
            Session::Local(s) => s.mail(from).await,
            Session::Remote(s) => s.mail(from).await,
        }
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        match self {
            Session::Local(s) => s.rcpt(to).await,
            Session::Remote(s) => s.rcpt(to).await,
        }
    }

    async fn data(&mut self, raw: Vec<u8>) -> Result<(), SmtpError> {
        match self {
            Session::Local(s) => s.data(raw).await,
            Session::Remote(s) => s.data(raw).await,
        }
    }

    fn reset(&mut self) {
        match self {
            Session::Local(s) => s.reset(),
            Session::Remote(s) => s.reset(),
        }
    }
}

impl SmtpBackend for Backend {
    type Session = Session;

    async fn login(
        &self,
        remote: &str,
        username: &str,
        password: &str,
    ) -> Result<Self::Session, SmtpError> {
        match self.mode {
            BackendMode::Internal => {
                // A username in address form must name this node; a bare
                // username is taken as the user's own.
                if username.contains('@') {
                    let key = address::parse_address(username)
                        .map_err(|_| SmtpError::new(535, "invalid credentials"))?;
                    if key != self.config.public_key_bytes() {
                        tracing::info!("failed SMTP authentication for {:?}", username);
                        return Err(SmtpError::new(535, "invalid credentials"));
                    }
                }
                let authed = self.storage.config_try_password(password).await?;
                if !authed {
                    tracing::info!("failed SMTP authentication for {:?}", username);
                    return Err(SmtpError::new(535, "invalid credentials"));
                }
                tracing::info!("authenticated SMTP user {:?}", username);
                Ok(Session::Local(SessionLocal::new(
                    self.config.clone(),
                    self.storage.clone(),
                    self.queues.clone(),
                    self.notify.clone(),
                    remote.to_string(),
                )))
            }
            BackendMode::External => Err(SmtpError::fatal(
                502,
                "not expecting authenticated connection on external backend",
            )),
        }
    }

    async fn anonymous(&self, remote: &str) -> Result<Self::Session, SmtpError> {
        match self.mode {
            BackendMode::Internal => Err(SmtpError::fatal(
                530,
                "not expecting anonymous connection on internal backend",
            )),
            BackendMode::External => {
                // The connection came in over the overlay; the remote string
                // is the transport-authenticated public key.
                let decoded = hex::decode(remote)
                    .map_err(|_| SmtpError::fatal(550, "unrecognised peer identity"))?;
                if decoded.len() != 32 {
                    return Err(SmtpError::fatal(550, "unrecognised peer identity"));
                }
                tracing::info!("incoming SMTP session from {}", remote);
                Ok(Session::Remote(SessionRemote::new(
                    self.config.clone(),
                    self.storage.clone(),
                    self.notify.clone(),
                    remote.to_string(),
                )))
            }
        }
    }
}
