/*
 * queue.rs
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

//! Outbound queue table: one row per outstanding (destination, Outbox uid)
//! delivery. Rows cascade away when the Outbox mail is deleted.

use rusqlite::{params, OptionalExtension};

use crate::storage::{QueuedMail, Storage, StorageError, MAILBOX_OUTBOX};

const QUEUE_SELECT_DESTINATIONS: &str = "SELECT DISTINCT destination FROM queue";
const QUEUE_SELECT_IDS_FOR_DESTINATION: &str = "
    SELECT id, mail, rcpt FROM queue WHERE destination = ?1
    ORDER BY id DESC
";
const QUEUE_INSERT_DESTINATION_FOR_ID: &str = "
    INSERT INTO queue (destination, mailbox, id, mail, rcpt) VALUES(?1, ?2, ?3, ?4, ?5)
";
const QUEUE_DELETE_DESTINATION_FOR_ID: &str = "
    DELETE FROM queue WHERE destination = ?1 AND mailbox = ?2 AND id = ?3
";
const QUEUE_SELECT_IS_MESSAGE_PENDING_SEND: &str = "
    SELECT COUNT(*) FROM queue WHERE mailbox = ?1 AND id = ?2
";

impl Storage {
    /// Queue the Outbox message `id` for delivery to `destination` (a hex
    /// public key), remembering the envelope for the SMTP dialogue.
    pub async fn queue_insert_destination_for_id(
        &self,
        destination: &str,
        id: u32,
        from: &str,
        rcpt: &str,
    ) -> Result<(), StorageError> {
        let destination = destination.to_string();
        let from = from.to_string();
        let rcpt = rcpt.to_string();
        self.write(move |txn| {
            txn.prepare_cached(QUEUE_INSERT_DESTINATION_FOR_ID)?
                .execute(params![destination, MAILBOX_OUTBOX, id, from, rcpt])?;
            Ok(())
        })
        .await
    }

    /// Every destination with at least one outstanding delivery.
    pub async fn queue_list_destinations(&self) -> Result<Vec<String>, StorageError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(QUEUE_SELECT_DESTINATIONS)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    /// The outstanding deliveries for one destination, newest UID first.
    pub async fn queue_mail_ids_for_destination(
        &self,
        destination: &str,
    ) -> Result<Vec<QueuedMail>, StorageError> {
        let destination = destination.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare_cached(QUEUE_SELECT_IDS_FOR_DESTINATION)?;
            let rows = stmt.query_map(params![destination], |row| {
                Ok(QueuedMail {
                    id: row.get(0)?,
                    from: row.get(1)?,
                    rcpt: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Remove one destination's queue row after the peer accepted the mail.
    pub async fn queue_delete_destination_for_id(
        &self,
        destination: &str,
        id: u32,
    ) -> Result<(), StorageError> {
        let destination = destination.to_string();
        self.write(move |txn| {
            txn.prepare_cached(QUEUE_DELETE_DESTINATION_FOR_ID)?
                .execute(params![destination, MAILBOX_OUTBOX, id])?;
            Ok(())
        })
        .await
    }

    /// Whether any destination still has a queue row for this message.
    pub async fn queue_select_is_message_pending_send(
        &self,
        mailbox: &str,
        id: u32,
    ) -> Result<bool, StorageError> {
        let mailbox = mailbox.to_string();
        self.read(move |conn| {
            let count: Option<i64> = conn
                .prepare_cached(QUEUE_SELECT_IS_MESSAGE_PENDING_SEND)?
                .query_row(params![mailbox, id], |row| row.get(0))
                .optional()?;
            Ok(count.unwrap_or(0) > 0)
        })
        .await
    }
}
