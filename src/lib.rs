/*
 * lib.rs
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

//! Yggmail: a single-user mail server whose inter-server SMTP runs over a
//! cryptographically-addressed overlay. The node's Ed25519 public key is
//! its mail domain; local clients speak ordinary IMAP and SMTP on loopback.

pub mod address;
pub mod config;
pub mod imap;
pub mod mime;
pub mod node;
pub mod sender;
pub mod smtp;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use node::{Node, NodeError, NodeOptions};
