/*
 * mailboxes.rs
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

//! Mailboxes table. Deleting a mailbox cascades to its mails and their
//! queue rows; renaming cascades through the same foreign keys.

use rusqlite::{params, OptionalExtension};

use crate::storage::{Storage, StorageError, PROTECTED_MAILBOXES};

const MAILBOXES_LIST: &str = "SELECT mailbox FROM mailboxes ORDER BY mailbox";
const MAILBOXES_LIST_SUBSCRIBED: &str =
    "SELECT mailbox FROM mailboxes WHERE subscribed = 1 ORDER BY mailbox";
const MAILBOXES_SELECT: &str = "SELECT mailbox FROM mailboxes WHERE mailbox = ?1";
const MAILBOXES_CREATE: &str = "INSERT OR IGNORE INTO mailboxes (mailbox) VALUES(?1)";
const MAILBOXES_RENAME: &str = "UPDATE mailboxes SET mailbox = ?1 WHERE mailbox = ?2";
const MAILBOXES_DELETE: &str = "DELETE FROM mailboxes WHERE mailbox = ?1";
const MAILBOXES_SUBSCRIBE: &str = "UPDATE mailboxes SET subscribed = ?1 WHERE mailbox = ?2";

fn is_protected(name: &str) -> bool {
    PROTECTED_MAILBOXES.contains(&name)
}

impl Storage {
    /// Create a mailbox; creating an existing one is a no-op.
    pub async fn mailbox_create(&self, name: &str) -> Result<(), StorageError> {
        let name = name.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAILBOXES_CREATE)?.execute(params![name])?;
            Ok(())
        })
        .await
    }

    /// Delete a mailbox and, via cascade, its mails and queue rows.
    pub async fn mailbox_delete(&self, name: &str) -> Result<(), StorageError> {
        if is_protected(name) {
            return Err(StorageError::protected(name));
        }
        let name = name.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAILBOXES_DELETE)?.execute(params![name])?;
            Ok(())
        })
        .await
    }

    /// Rename a mailbox; the mails and queue rows follow through
    /// ON UPDATE CASCADE. Protected names cannot be renamed or taken.
    pub async fn mailbox_rename(&self, old: &str, new: &str) -> Result<(), StorageError> {
        if is_protected(old) {
            return Err(StorageError::protected(old));
        }
        if is_protected(new) {
            return Err(StorageError::protected(new));
        }
        let old = old.to_string();
        let new = new.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAILBOXES_RENAME)?
                .execute(params![new, old])?;
            Ok(())
        })
        .await
    }

    pub async fn mailbox_subscribe(&self, name: &str, subscribed: bool) -> Result<(), StorageError> {
        let name = name.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAILBOXES_SUBSCRIBE)?
                .execute(params![subscribed as i64, name])?;
            Ok(())
        })
        .await
    }

    /// All mailbox names, optionally only the subscribed ones.
    pub async fn mailbox_list(&self, only_subscribed: bool) -> Result<Vec<String>, StorageError> {
        self.read(move |conn| {
            let sql = if only_subscribed {
                MAILBOXES_LIST_SUBSCRIBED
            } else {
                MAILBOXES_LIST
            };
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    /// Whether a mailbox exists.
    pub async fn mailbox_select(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.to_string();
        self.read(move |conn| {
            let found: Option<String> = conn
                .prepare_cached(MAILBOXES_SELECT)?
                .query_row(params![name], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}
