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

//! Node identity: one Ed25519 keypair per running node. The public key is
//! the mail domain and the overlay endpoint; the private key lives hex-encoded
//! in the store's config table and is generated lazily on first run.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::storage::{Storage, StorageError};

/// Config table key holding the hex-encoded private key.
const CONFIG_PRIVATE_KEY: &str = "private_key";

/// Immutable node identity, shared by every subsystem.
#[derive(Clone)]
pub struct Config {
    signing_key: SigningKey,
}

impl Config {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Load the identity from the store, generating and persisting a fresh
    /// keypair if none is stored yet.
    pub async fn load_or_create(storage: &Storage) -> Result<(Self, bool), StorageError> {
        let stored = storage.config_get(CONFIG_PRIVATE_KEY).await?;
        if !stored.is_empty() {
            let bytes = hex::decode(&stored)
                .map_err(|_| StorageError::new("stored private key is not valid hex"))?;
            let key: [u8; 32] = bytes[..]
                .try_into()
                .map_err(|_| StorageError::new("stored private key has wrong length"))?;
            return Ok((Self::new(SigningKey::from_bytes(&key)), false));
        }
        let signing_key = SigningKey::generate(&mut OsRng);
        storage
            .config_set(CONFIG_PRIVATE_KEY, &hex::encode(signing_key.to_bytes()))
            .await?;
        Ok((Self::new(signing_key), true))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex rendering of the public key: the node's mail domain.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// The node's one mail address, `<hex>@yggmail`.
    pub fn mail_address(&self) -> String {
        crate::address::format_address(&self.public_key_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_address_matches_key() {
        let key = SigningKey::from_bytes(&[0x11; 32]);
        let config = Config::new(key);
        let addr = config.mail_address();
        assert!(addr.ends_with("@yggmail"));
        assert_eq!(
            crate::address::parse_address(&addr).unwrap(),
            config.public_key_bytes()
        );
    }
}
