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

//! SMTP: a minimal client for the outbound drainer and a server state
//! machine backing both ingress faces — the authenticated loopback
//! submission face and the anonymous overlay reception face.

mod backend;
mod client;
pub mod dot_stuffer;
mod server;
mod session_local;
mod session_remote;

pub use backend::{Backend, BackendMode};
pub use client::SmtpClient;
pub use server::{serve_connection, SmtpBackend, SmtpServerConfig, SmtpSession};
pub use session_local::SessionLocal;
pub use session_remote::SessionRemote;

use std::fmt;
use std::io;

/// SMTP-level error: the reply code sent to the peer, and whether the
/// session must be terminated afterwards (peer-authenticity violations).
#[derive(Debug)]
pub struct SmtpError {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

impl SmtpError {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            fatal: false,
        }
    }

    pub fn fatal(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for SmtpError {}

impl From<io::Error> for SmtpError {
    fn from(e: io::Error) -> Self {
        Self::fatal(421, e.to_string())
    }
}

impl From<crate::storage::StorageError> for SmtpError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::new(451, format!("temporary storage failure: {}", e))
    }
}

impl From<crate::mime::MimeError> for SmtpError {
    fn from(e: crate::mime::MimeError) -> Self {
        Self::new(550, e.to_string())
    }
}
