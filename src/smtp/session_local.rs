/*
 * session_local.rs
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

//! Authenticated submission session. Only the node's own address may send;
//! self-addressed mail goes straight to INBOX, everything else is written
//! once to the Outbox and queued per destination.

use std::sync::Arc;

use crate::address;
use crate::config::Config;
use crate::imap::Notify;
use crate::mime::{datetime, Message};
use crate::sender::Queues;
use crate::smtp::SmtpError;
use crate::storage::{Storage, MAILBOX_INBOX};

pub struct SessionLocal {
    config: Config,
    storage: Storage,
    queues: Arc<Queues>,
    notify: Notify,
    remote: String,
    from: Option<String>,
    rcpts: Vec<String>,
}

impl SessionLocal {
    pub fn new(
        config: Config,
        storage: Storage,
        queues: Arc<Queues>,
        notify: Notify,
        remote: String,
    ) -> Self {
        Self {
            config,
            storage,
            queues,
            notify,
            remote,
            from: None,
            rcpts: Vec::new(),
        }
    }

    pub async fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        let key = address::parse_address(from)
            .map_err(|_| SmtpError::new(550, format!("not allowed to send outgoing mail as {}", from)))?;
        if key != self.config.public_key_bytes() {
            return Err(SmtpError::new(
                550,
                format!("not allowed to send outgoing mail as {}", from),
            ));
        }
        self.from = Some(from.to_string());
        Ok(())
    }

    pub async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        self.rcpts.push(to.to_string());
        Ok(())
    }

    pub async fn data(&mut self, raw: Vec<u8>) -> Result<(), SmtpError> {
        let from = self
            .from
            .clone()
            .ok_or_else(|| SmtpError::new(503, "MAIL first"))?;

        let mut message = Message::parse(raw)?;
        if message.header("Date").is_none() {
            message.prepend("Date", &datetime::now_rfc2822());
        }
        message.prepend(
            "Received",
            &format!(
                "from {} by Yggmail {}; {}",
                self.remote,
                self.config.public_key_hex(),
                datetime::now_rfc2822()
            ),
        );
        let content = message.to_bytes();

        // Parse every recipient up front: one bad address fails the whole
        // submission before anything is stored.
        let mut hosts: Vec<(String, String)> = Vec::new();
        for rcpt in &self.rcpts {
            let key = address::parse_address(rcpt)
                .map_err(|e| SmtpError::new(550, format!("bad recipient {}: {}", rcpt, e)))?;
            let host = hex::encode(key);
            if !hosts.iter().any(|(h, _)| h == &host) {
                hosts.push((host, rcpt.clone()));
            }
        }

        let local = self.config.public_key_hex();
        let mut remote_hosts: Vec<(String, String)> = Vec::new();
        for (host, rcpt) in hosts {
            if host == local {
                let uid = self
                    .storage
                    .mail_create(MAILBOX_INBOX, content.clone())
                    .await?;
                let total = self.storage.mail_count(MAILBOX_INBOX).await?;
                self.notify.notify_new(uid, total).await;
                tracing::info!("delivered mail to own INBOX");
            } else {
                remote_hosts.push((host, rcpt));
            }
        }

        if !remote_hosts.is_empty() {
            self.queues
                .enqueue(&from, &remote_hosts, content)
                .await
                .map_err(SmtpError::from)?;
        }

        Ok(())
    }

    pub fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }
}
