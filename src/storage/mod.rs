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

//! Persistent store: config, mailboxes, mails, outbound queue, all in one
//! SQLite file. Mutations are funneled through a single writer thread that
//! owns the writing connection and consumes closures from a channel; each
//! closure runs inside a transaction that commits on Ok and rolls back on
//! Err. Reads run concurrently on a small pool of reader connections.

mod config;
mod mailboxes;
mod mails;
mod queue;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Semaphore};

pub const MAILBOX_INBOX: &str = "INBOX";
pub const MAILBOX_OUTBOX: &str = "Outbox";

/// Mailboxes that can never be deleted or renamed.
pub const PROTECTED_MAILBOXES: &[&str] = &["INBOX", "Outbox", "Sent"];

/// The store never renumbers UIDs, so validity is constant.
pub const UID_VALIDITY: u32 = 1;

const READER_POOL_SIZE: usize = 4;
const WRITE_QUEUE_DEPTH: usize = 64;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS config (
        key         TEXT NOT NULL,
        value       TEXT NOT NULL,
        PRIMARY KEY(key)
    );

    CREATE TABLE IF NOT EXISTS mailboxes (
        mailbox     TEXT NOT NULL DEFAULT('INBOX'),
        subscribed  BOOLEAN NOT NULL DEFAULT 1,
        PRIMARY KEY(mailbox)
    );

    CREATE TABLE IF NOT EXISTS mails (
        mailbox     TEXT NOT NULL,
        id          INTEGER NOT NULL DEFAULT 1,
        mail        BLOB NOT NULL,
        datetime    INTEGER NOT NULL,
        seen        BOOLEAN NOT NULL DEFAULT 0, -- the mail has been read
        answered    BOOLEAN NOT NULL DEFAULT 0, -- the mail has been replied to
        flagged     BOOLEAN NOT NULL DEFAULT 0, -- flagged for later attention
        deleted     BOOLEAN NOT NULL DEFAULT 0, -- removed at next EXPUNGE
        PRIMARY KEY(mailbox, id),
        FOREIGN KEY (mailbox) REFERENCES mailboxes(mailbox) ON DELETE CASCADE ON UPDATE CASCADE
    );

    DROP VIEW IF EXISTS sequenced;
    CREATE VIEW IF NOT EXISTS sequenced AS
        SELECT ROW_NUMBER() OVER (PARTITION BY mailbox ORDER BY id) AS seq, * FROM mails;

    CREATE TABLE IF NOT EXISTS queue (
        destination TEXT NOT NULL,
        mailbox     TEXT NOT NULL,
        id          INTEGER NOT NULL,
        mail        TEXT NOT NULL,
        rcpt        TEXT NOT NULL,
        PRIMARY KEY (destination, mailbox, id),
        FOREIGN KEY (mailbox, id) REFERENCES mails(mailbox, id) ON DELETE CASCADE ON UPDATE CASCADE
    );
";

/// Storage errors. Protected-mailbox violations and missing rows are
/// distinguished so the protocol layers can map them to the right responses.
#[derive(Debug)]
pub enum StorageError {
    /// Delete/rename of INBOX, Outbox or Sent, or a move into Outbox.
    Protected(String),
    /// The requested row does not exist.
    NotFound,
    /// Anything else: I/O, constraint violations, a dead writer.
    Message(String),
}

impl StorageError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    pub fn protected(name: &str) -> Self {
        Self::Protected(name.to_string())
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Protected(name) => {
                write!(f, "{} is a protected mailbox", name)
            }
            StorageError::NotFound => write!(f, "not found"),
            StorageError::Message(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            other => StorageError::Message(other.to_string()),
        }
    }
}

/// One stored message.
#[derive(Debug, Clone)]
pub struct Mail {
    pub mailbox: String,
    pub id: u32,
    pub mail: Vec<u8>,
    pub datetime: i64,
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
}

impl Mail {
    /// Flags as a (seen, answered, flagged, deleted) tuple, the order every
    /// flag-taking store operation uses.
    pub fn flags(&self) -> (bool, bool, bool, bool) {
        (self.seen, self.answered, self.flagged, self.deleted)
    }
}

/// One outstanding delivery: the queue row for a (destination, uid) pair.
#[derive(Debug, Clone)]
pub struct QueuedMail {
    pub id: u32,
    pub from: String,
    pub rcpt: String,
}

type WriteJob = Box<dyn FnOnce(&mut Connection) + Send>;

struct Inner {
    write_tx: mpsc::Sender<WriteJob>,
    readers: Mutex<Vec<Connection>>,
    reader_slots: Arc<Semaphore>,
    path: PathBuf,
}

/// Handle to the store; cheap to clone, all clones share the writer.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    /// Open (creating if absent) the database at `path`, run the schema,
    /// start the writer thread and auto-create INBOX and Outbox.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let writer_path = path.clone();
        let writer_conn = tokio::task::spawn_blocking(move || open_connection(&writer_path, true))
            .await
            .map_err(|e| StorageError::new(e.to_string()))??;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteJob>(WRITE_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("yggmail-storage".to_string())
            .spawn(move || {
                let mut conn = writer_conn;
                while let Some(job) = write_rx.blocking_recv() {
                    job(&mut conn);
                }
            })
            .map_err(|e| StorageError::new(e.to_string()))?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let reader_path = path.clone();
            let conn = tokio::task::spawn_blocking(move || open_connection(&reader_path, false))
                .await
                .map_err(|e| StorageError::new(e.to_string()))??;
            readers.push(conn);
        }

        let storage = Self {
            inner: Arc::new(Inner {
                write_tx,
                readers: Mutex::new(readers),
                reader_slots: Arc::new(Semaphore::new(READER_POOL_SIZE)),
                path,
            }),
        };

        for name in [MAILBOX_INBOX, MAILBOX_OUTBOX] {
            storage.mailbox_create(name).await?;
        }

        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run a mutation inside a transaction on the writer thread. Commit on
    /// Ok, rollback on Err; the closure's result comes back to the caller.
    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |conn| {
            let result: rusqlite::Result<T> = (|| {
                let txn = conn.transaction()?;
                let value = f(&txn)?;
                txn.commit()?;
                Ok(value)
            })();
            let _ = tx.send(result);
        });
        self.inner
            .write_tx
            .send(job)
            .await
            .map_err(|_| StorageError::new("storage writer has stopped"))?;
        rx.await
            .map_err(|_| StorageError::new("storage writer dropped the request"))?
            .map_err(StorageError::from)
    }

    /// Run a read on one of the pooled reader connections.
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .inner
            .reader_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::new("storage reader pool closed"))?;
        let conn = self
            .inner
            .readers
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| StorageError::new("storage reader pool exhausted"))?;
        let (result, conn) = tokio::task::spawn_blocking(move || {
            let r = f(&conn);
            (r, conn)
        })
        .await
        .map_err(|e| StorageError::new(e.to_string()))?;
        self.inner.readers.lock().unwrap().push(conn);
        drop(permit);
        result.map_err(StorageError::from)
    }
}

fn open_connection(path: &Path, init: bool) -> Result<Connection, StorageError> {
    let conn = Connection::open(path).map_err(StorageError::from)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(StorageError::from)?;
    if init {
        conn.execute_batch(SCHEMA).map_err(StorageError::from)?;
    }
    Ok(conn)
}
