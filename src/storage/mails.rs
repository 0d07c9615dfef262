/*
 * mails.rs
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

//! Mails table. UIDs are per-mailbox, assigned at insert as MAX(id)+1 and
//! never reused; sequence numbers are a view computed with ROW_NUMBER()
//! over the UID order, never stored.

use rusqlite::params;

use crate::storage::{Mail, Storage, StorageError, MAILBOX_OUTBOX};

const MAIL_SELECT: &str = "
    SELECT seq, id, mail, datetime, seen, answered, flagged, deleted FROM sequenced
    WHERE mailbox = ?1 AND id = ?2
";
const MAIL_COUNT: &str = "SELECT COUNT(*) FROM mails WHERE mailbox = ?1";
const MAIL_UNSEEN: &str = "SELECT COUNT(*) FROM mails WHERE mailbox = ?1 AND seen = 0";
const MAIL_SEARCH: &str = "SELECT id FROM mails WHERE mailbox = ?1 ORDER BY id";
const MAIL_CREATE: &str = "
    INSERT INTO mails (mailbox, id, mail, datetime) VALUES(
        ?1, (
            SELECT IFNULL(MAX(id)+1,1) AS id FROM mails WHERE mailbox = ?1
        ), ?2, ?3
    )
    RETURNING id
";
const MAIL_ID_FOR_SEQ: &str = "SELECT id FROM sequenced WHERE mailbox = ?1 AND seq = ?2";
const MAIL_NEXT_ID: &str = "SELECT IFNULL(MAX(id)+1,1) AS id FROM mails WHERE mailbox = ?1";
const MAIL_UPDATE_FLAGS: &str = "
    UPDATE mails SET seen = ?1, answered = ?2, flagged = ?3, deleted = ?4
    WHERE mailbox = ?5 AND id = ?6
";
const MAIL_DELETE: &str = "UPDATE mails SET deleted = 1 WHERE mailbox = ?1 AND id = ?2";
const MAIL_EXPUNGE: &str = "DELETE FROM mails WHERE mailbox = ?1 AND deleted = 1";
const MAIL_MOVE: &str = "
    UPDATE mails SET mailbox = ?1, id = (
        SELECT IFNULL(MAX(id)+1,1) FROM mails WHERE mailbox = ?1
    )
    WHERE mailbox = ?2 AND id = ?3
";

impl Storage {
    /// Store a message, assigning the mailbox's next UID. Returns the UID.
    pub async fn mail_create(&self, mailbox: &str, data: Vec<u8>) -> Result<u32, StorageError> {
        let mailbox = mailbox.to_string();
        self.write(move |txn| {
            let now = chrono::Utc::now().timestamp();
            txn.prepare_cached(MAIL_CREATE)?
                .query_row(params![mailbox, data, now], |row| row.get(0))
        })
        .await
    }

    /// Fetch a message by UID along with its current sequence number.
    pub async fn mail_select(&self, mailbox: &str, id: u32) -> Result<(u32, Mail), StorageError> {
        let name = mailbox.to_string();
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            conn.prepare_cached(MAIL_SELECT)?
                .query_row(params![name, id], |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        Mail {
                            mailbox: mailbox.clone(),
                            id: row.get(1)?,
                            mail: row.get(2)?,
                            datetime: row.get(3)?,
                            seen: row.get(4)?,
                            answered: row.get(5)?,
                            flagged: row.get(6)?,
                            deleted: row.get(7)?,
                        },
                    ))
                })
        })
        .await
    }

    /// All UIDs in the mailbox, ascending.
    pub async fn mail_search(&self, mailbox: &str) -> Result<Vec<u32>, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(MAIL_SEARCH)?;
            let rows = stmt.query_map(params![mailbox], |row| row.get::<_, u32>(0))?;
            rows.collect()
        })
        .await
    }

    /// The UID the next insert would be assigned.
    pub async fn mail_next_id(&self, mailbox: &str) -> Result<u32, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            conn.prepare_cached(MAIL_NEXT_ID)?
                .query_row(params![mailbox], |row| row.get(0))
        })
        .await
    }

    /// UID of the message at 1-based sequence position `seq`.
    pub async fn mail_id_for_seq(&self, mailbox: &str, seq: u32) -> Result<u32, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            conn.prepare_cached(MAIL_ID_FOR_SEQ)?
                .query_row(params![mailbox, seq], |row| row.get(0))
        })
        .await
    }

    pub async fn mail_count(&self, mailbox: &str) -> Result<u32, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            conn.prepare_cached(MAIL_COUNT)?
                .query_row(params![mailbox], |row| row.get(0))
        })
        .await
    }

    pub async fn mail_unseen(&self, mailbox: &str) -> Result<u32, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            conn.prepare_cached(MAIL_UNSEEN)?
                .query_row(params![mailbox], |row| row.get(0))
        })
        .await
    }

    /// Overwrite all four flags (SET semantics; add/remove is the IMAP
    /// adapter's job).
    pub async fn mail_update_flags(
        &self,
        mailbox: &str,
        id: u32,
        seen: bool,
        answered: bool,
        flagged: bool,
        deleted: bool,
    ) -> Result<(), StorageError> {
        let mailbox = mailbox.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAIL_UPDATE_FLAGS)?.execute(params![
                seen as i64,
                answered as i64,
                flagged as i64,
                deleted as i64,
                mailbox,
                id
            ])?;
            Ok(())
        })
        .await
    }

    /// Tombstone a message; physical removal happens at the next expunge.
    pub async fn mail_delete(&self, mailbox: &str, id: u32) -> Result<(), StorageError> {
        let mailbox = mailbox.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAIL_DELETE)?.execute(params![mailbox, id])?;
            Ok(())
        })
        .await
    }

    /// Physically delete everything tombstoned in the mailbox.
    pub async fn mail_expunge(&self, mailbox: &str) -> Result<(), StorageError> {
        let mailbox = mailbox.to_string();
        self.write(move |txn| {
            txn.prepare_cached(MAIL_EXPUNGE)?.execute(params![mailbox])?;
            Ok(())
        })
        .await
    }

    /// Move a message to another mailbox, assigning it the destination's
    /// next UID. Moving into Outbox is refused; only the sender may queue.
    pub async fn mail_move(
        &self,
        mailbox: &str,
        id: u32,
        destination: &str,
    ) -> Result<u32, StorageError> {
        if destination == MAILBOX_OUTBOX {
            return Err(StorageError::protected(destination));
        }
        let mailbox = mailbox.to_string();
        let destination = destination.to_string();
        self.write(move |txn| {
            let moved = txn
                .prepare_cached(MAIL_MOVE)?
                .execute(params![destination, mailbox, id])?;
            if moved == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            txn.prepare_cached("SELECT MAX(id) FROM mails WHERE mailbox = ?1")?
                .query_row(params![destination], |row| row.get(0))
        })
        .await
    }
}
