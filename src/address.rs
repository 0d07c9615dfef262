/*
 * address.rs
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

//! Mail addresses: `<64-hex-public-key>@yggmail`. The local part is the
//! hex-encoded Ed25519 public key of the destination node; the domain is
//! fixed. Nothing else is a well-formed address in this system.

use std::fmt;

/// The fixed domain suffix carried by every address.
pub const DOMAIN: &str = "yggmail";

/// Malformed address (wrong suffix, local part not 64 hex digits).
#[derive(Debug)]
pub struct AddressError {
    pub message: String,
}

impl AddressError {
    fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AddressError {}

/// Format the address owned by a public key: `<hex>@yggmail`.
pub fn format_address(public_key: &[u8; 32]) -> String {
    format!("{}@{}", hex::encode(public_key), DOMAIN)
}

/// Parse an address into the public key it names.
///
/// Accepts an optional `Name <addr>` wrapper and surrounding angle brackets,
/// since SMTP and RFC 5322 both deliver addresses in that shape.
pub fn parse_address(address: &str) -> Result<[u8; 32], AddressError> {
    let address = strip_wrapper(address.trim());
    let at = address
        .rfind('@')
        .ok_or_else(|| AddressError::new(format!("invalid address {:?}", address)))?;
    let (local, domain) = (&address[..at], &address[at + 1..]);
    if domain != DOMAIN {
        return Err(AddressError::new(format!("invalid domain {:?}", domain)));
    }
    if local.len() != 64 {
        return Err(AddressError::new(format!("invalid public key {:?}", local)));
    }
    let bytes = hex::decode(local)
        .map_err(|_| AddressError::new(format!("invalid public key {:?}", local)))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Hex public key part of an address, without decoding it.
pub fn parse_address_host(address: &str) -> Result<String, AddressError> {
    parse_address(address).map(hex::encode)
}

/// Strip `Name <addr>` and bare `<addr>` down to addr.
fn strip_wrapper(address: &str) -> &str {
    match (address.rfind('<'), address.rfind('>')) {
        (Some(open), Some(close)) if open < close => address[open + 1..close].trim(),
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let key = [0xaa; 32];
        let addr = format_address(&key);
        assert_eq!(addr.len(), 64 + 1 + DOMAIN.len());
        assert_eq!(parse_address(&addr).unwrap(), key);
    }

    #[test]
    fn address_with_display_name() {
        let key = [0x07; 32];
        let wrapped = format!("Someone <{}>", format_address(&key));
        assert_eq!(parse_address(&wrapped).unwrap(), key);
        let bare = format!("<{}>", format_address(&key));
        assert_eq!(parse_address(&bare).unwrap(), key);
    }

    #[test]
    fn address_rejects_wrong_domain() {
        let key = [0x01; 32];
        let addr = format!("{}@example.com", hex::encode(key));
        assert!(parse_address(&addr).is_err());
    }

    #[test]
    fn address_rejects_bad_local_part() {
        assert!(parse_address("tooshort@yggmail").is_err());
        // 64 chars but not hex
        let zz = "z".repeat(64);
        assert!(parse_address(&format!("{}@yggmail", zz)).is_err());
        // 63 hex chars
        let short = "a".repeat(63);
        assert!(parse_address(&format!("{}@yggmail", short)).is_err());
        assert!(parse_address("no-at-sign").is_err());
    }
}
