/*
 * config.rs
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

//! Config table: key/value pairs, keys unique. Holds the node's private
//! key and the bcrypt password hash.

use rusqlite::{params, OptionalExtension};

use crate::storage::{Storage, StorageError};

const CONFIG_PASSWORD: &str = "password";

const CONFIG_GET: &str = "SELECT value FROM config WHERE key = ?1";
const CONFIG_SET: &str = "INSERT OR REPLACE INTO config (key, value) VALUES(?1, ?2)";

impl Storage {
    /// Value for a key; a missing key is the empty string, not an error.
    pub async fn config_get(&self, key: &str) -> Result<String, StorageError> {
        let key = key.to_string();
        self.read(move |conn| {
            let value: Option<String> = conn
                .prepare_cached(CONFIG_GET)?
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            Ok(value.unwrap_or_default())
        })
        .await
    }

    /// Upsert a key.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.write(move |txn| {
            txn.prepare_cached(CONFIG_SET)?
                .execute(params![key, value])?;
            Ok(())
        })
        .await
    }

    /// Store an already-hashed credential under the password key.
    pub async fn config_set_password(&self, hash: &str) -> Result<(), StorageError> {
        self.config_set(CONFIG_PASSWORD, hash).await
    }

    /// True when no password hash is stored, or when bcrypt verification of
    /// `password` against the stored hash succeeds. A malformed stored hash
    /// counts as a failed verification.
    pub async fn config_try_password(&self, password: &str) -> Result<bool, StorageError> {
        let hash = self.config_get(CONFIG_PASSWORD).await?;
        if hash.is_empty() {
            return Ok(true);
        }
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| StorageError::new(e.to_string()))?;
        match verified {
            Ok(ok) => Ok(ok),
            Err(e) => {
                tracing::warn!("stored password hash failed to verify: {}", e);
                Ok(false)
            }
        }
    }
}
