/*
 * session_remote.rs
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

//! Overlay reception session. The transport proved who the peer is; this
//! session only checks that the claimed sender matches that identity and
//! that the recipient is this node, then files the mail into INBOX.

use crate::address;
use crate::config::Config;
use crate::imap::Notify;
use crate::mime::{datetime, Message};
use crate::smtp::SmtpError;
use crate::storage::{Storage, MAILBOX_INBOX};

pub struct SessionRemote {
    config: Config,
    storage: Storage,
    notify: Notify,
    remote: String,
    from: Option<String>,
}

impl SessionRemote {
    pub fn new(config: Config, storage: Storage, notify: Notify, remote: String) -> Self {
        Self {
            config,
            storage,
            notify,
            remote,
            from: None,
        }
    }

    pub async fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        let key = address::parse_address(from)
            .map_err(|_| SmtpError::fatal(550, format!("not allowed to send incoming mail as {}", from)))?;
        // The claimed sender must be the key that authenticated the session.
        if hex::encode(key) != self.remote {
            return Err(SmtpError::fatal(
                550,
                format!("not allowed to send incoming mail as {}", from),
            ));
        }
        self.from = Some(from.to_string());
        Ok(())
    }

    pub async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        let key = address::parse_address(to)
            .map_err(|e| SmtpError::new(550, format!("bad recipient: {}", e)))?;
        if key != self.config.public_key_bytes() {
            return Err(SmtpError::new(550, "unexpected recipient for wrong domain"));
        }
        Ok(())
    }

    pub async fn data(&mut self, raw: Vec<u8>) -> Result<(), SmtpError> {
        let mut message = Message::parse(raw)?;
        message.prepend(
            "Received",
            &format!("from Yggmail {}; {}", self.remote, datetime::now_rfc2822()),
        );
        message.prepend("Delivery-Date", &datetime::now_rfc2822());

        let uid = self
            .storage
            .mail_create(MAILBOX_INBOX, message.to_bytes())
            .await?;
        let total = self.storage.mail_count(MAILBOX_INBOX).await?;
        self.notify.notify_new(uid, total).await;
        tracing::info!(
            "stored new mail from {}",
            self.from.as_deref().unwrap_or("unknown sender")
        );
        Ok(())
    }

    pub fn reset(&mut self) {
        self.from = None;
    }
}
