/*
 * notify.rs
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

//! Push notifications for newly delivered mail. Sessions register a shared
//! handle; when a message lands in INBOX every authenticated session gets
//! an untagged response — EXISTS when it has INBOX selected, a STATUS
//! summary otherwise. Advertised to clients as the NOTIFY capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::storage::MAILBOX_INBOX;

/// The part of an IMAP session the notifier can reach: its outbound pipe
/// and enough state to pick the right untagged response.
pub struct SessionShared {
    pub out_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub authenticated: AtomicBool,
    pub selected: Mutex<Option<String>>,
}

impl SessionShared {
    pub fn new(out_tx: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            out_tx,
            authenticated: AtomicBool::new(false),
            selected: Mutex::new(None),
        })
    }

    pub fn send_line(&self, line: String) {
        let mut bytes = line.into_bytes();
        bytes.extend_from_slice(b"\r\n");
        let _ = self.out_tx.send(bytes);
    }
}

#[derive(Clone, Default)]
pub struct Notify {
    sessions: Arc<Mutex<Vec<Weak<SessionShared>>>>,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shared: &Arc<SessionShared>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(shared));
    }

    /// Announce a new INBOX message with UID `uid`; `total` is the INBOX
    /// message count after delivery.
    pub async fn notify_new(&self, uid: u32, total: u32) {
        let handles: Vec<Arc<SessionShared>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        for shared in handles {
            if !shared.authenticated.load(Ordering::Acquire) {
                continue;
            }
            let selected = shared.selected.lock().unwrap().clone();
            if selected.as_deref() == Some(MAILBOX_INBOX) {
                shared.send_line(format!("* {} EXISTS", uid));
            } else {
                shared.send_line(format!(
                    "* STATUS \"INBOX\" (UIDNEXT {} MESSAGES {})",
                    uid + 1,
                    total
                ));
            }
        }
    }
}
