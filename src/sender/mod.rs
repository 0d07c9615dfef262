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

//! Outbound delivery. One queue per destination key, each with at most one
//! drainer task at a time. The queue table is the only source of truth: a
//! drainer snapshots the outstanding rows, walks them newest UID first, and
//! removes a row only after the peer accepted DATA — at-least-once, never
//! lost. A manager pass every five minutes restarts drainers for whatever
//! the table still holds, which is how delivery resumes after a restart.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::smtp::SmtpClient;
use crate::storage::{QueuedMail, Storage, MAILBOX_OUTBOX};
use crate::transport::Transport;

/// How often the manager re-checks the queue table for destinations whose
/// drainer is not running.
pub const MANAGER_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct SenderError {
    pub message: String,
}

impl SenderError {
    fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for SenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SenderError {}

impl From<crate::storage::StorageError> for SenderError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<crate::transport::TransportError> for SenderError {
    fn from(e: crate::transport::TransportError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<crate::smtp::SmtpError> for SenderError {
    fn from(e: crate::smtp::SmtpError) -> Self {
        Self::new(e.to_string())
    }
}

/// One destination's queue; the flag guarantees a single drainer.
struct Queue {
    destination: String,
    running: AtomicBool,
}

struct QueuesInner {
    config: Config,
    storage: Storage,
    transport: Transport,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    shutdown: CancellationToken,
}

/// The sender: owns every destination queue and the manager task.
pub struct Queues {
    inner: Arc<QueuesInner>,
}

impl Queues {
    pub fn new(config: Config, storage: Storage, transport: Transport) -> Arc<Self> {
        let queues = Arc::new(Self {
            inner: Arc::new(QueuesInner {
                config,
                storage,
                transport,
                queues: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        });
        tokio::spawn(manager_task(queues.inner.clone()));
        queues
    }

    /// Queue one submitted message: a single Outbox row, then one queue row
    /// per destination, then a drainer wake for each destination.
    /// `destinations` pairs each distinct destination key (hex) with the
    /// recipient address used on the wire.
    pub async fn enqueue(
        &self,
        from: &str,
        destinations: &[(String, String)],
        content: Vec<u8>,
    ) -> Result<(), crate::storage::StorageError> {
        let id = self
            .inner
            .storage
            .mail_create(MAILBOX_OUTBOX, content)
            .await?;
        for (host, rcpt) in destinations {
            self.inner
                .storage
                .queue_insert_destination_for_id(host, id, from, rcpt)
                .await?;
        }
        for (host, _) in destinations {
            self.wake(host);
            tracing::info!("queued mail for {}", host);
        }
        Ok(())
    }

    /// Ensure a drainer is running for the destination. The false-to-true
    /// swap on the running flag is what keeps it to one drainer.
    pub fn wake(&self, destination: &str) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        wake_on(&self.inner, destination);
    }

    /// Stop waking drainers; rows stay in the table for the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Every five minutes, restart drainers for all destinations with rows.
/// The first pass runs immediately: this is restart recovery.
async fn manager_task(inner: Arc<QueuesInner>) {
    loop {
        match inner.storage.queue_list_destinations().await {
            Ok(destinations) => {
                for destination in destinations {
                    wake_on(&inner, &destination);
                }
            }
            Err(e) => tracing::warn!("queue manager could not list destinations: {}", e),
        }
        tokio::select! {
            _ = tokio::time::sleep(MANAGER_INTERVAL) => {}
            _ = inner.shutdown.cancelled() => return,
        }
    }
}

fn wake_on(inner: &Arc<QueuesInner>, destination: &str) {
    let queue = {
        let mut map = inner.queues.lock().unwrap();
        map.entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(Queue {
                    destination: destination.to_string(),
                    running: AtomicBool::new(false),
                })
            })
            .clone()
    };
    if queue
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        tokio::spawn(drainer_task(inner.clone(), queue));
    }
}

/// One drainer pass. On any failure the pass stops with the remaining rows
/// in place; the manager or the next submission retries. Outbox mails whose
/// last queue row went are tombstoned here and swept on the way out.
async fn drainer_task(inner: Arc<QueuesInner>, queue: Arc<Queue>) {
    if let Err(e) = drain(&inner, &queue).await {
        tracing::warn!(
            "delivery to {} interrupted: {} - will retry",
            queue.destination,
            e
        );
    }
    if let Err(e) = inner.storage.mail_expunge(MAILBOX_OUTBOX).await {
        tracing::warn!("outbox sweep failed: {}", e);
    }
    queue.running.store(false, Ordering::SeqCst);
}

async fn drain(inner: &Arc<QueuesInner>, queue: &Arc<Queue>) -> Result<(), SenderError> {
    let refs = inner
        .storage
        .queue_mail_ids_for_destination(&queue.destination)
        .await?;
    if refs.is_empty() {
        return Ok(());
    }
    tracing::info!(
        "there are {} mail(s) queued for {}",
        refs.len(),
        queue.destination
    );

    for entry in refs {
        let (_, mail) = match inner.storage.mail_select(MAILBOX_OUTBOX, entry.id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("failed to load queued mail {}: {}", entry.id, e);
                continue;
            }
        };
        send_one(inner, &queue.destination, &entry, &mail.mail).await?;
        tracing::info!("sent mail from {} to {}", entry.from, queue.destination);
    }
    Ok(())
}

async fn send_one(
    inner: &Arc<QueuesInner>,
    destination: &str,
    entry: &QueuedMail,
    content: &[u8],
) -> Result<(), SenderError> {
    let stream = inner.transport.dial(destination).await?;
    let mut client = SmtpClient::connect(stream).await?;
    client.hello(&inner.config.public_key_hex()).await?;
    client.mail(&entry.from).await?;
    client.rcpt(&entry.rcpt).await?;
    client.data(content).await?;

    // The peer has taken responsibility; only now may the row go.
    inner
        .storage
        .queue_delete_destination_for_id(destination, entry.id)
        .await?;
    let pending = inner
        .storage
        .queue_select_is_message_pending_send(MAILBOX_OUTBOX, entry.id)
        .await?;
    if !pending {
        inner.storage.mail_delete(MAILBOX_OUTBOX, entry.id).await?;
    }

    let _ = client.quit().await;
    Ok(())
}
