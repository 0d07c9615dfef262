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

//! RFC 5322 message handling, reduced to what the two SMTP faces and the
//! IMAP FETCH projection need: split headers from body, read and unfold
//! header fields, prepend trace headers at delivery time, and serialize.
//! The stored message bytes are never rewritten; delivery-time headers are
//! prepended in front of the original bytes.

pub mod body;
pub mod datetime;
pub mod envelope;

use std::fmt;

#[derive(Debug)]
pub struct MimeError {
    pub message: String,
}

impl MimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for MimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MimeError {}

/// A parsed message: original bytes plus headers prepended at delivery time.
#[derive(Debug, Clone)]
pub struct Message {
    prepended: Vec<(String, String)>,
    raw: Vec<u8>,
    body_start: usize,
}

impl Message {
    /// A message with no headers and no body.
    pub fn empty() -> Self {
        Self {
            prepended: Vec::new(),
            raw: Vec::new(),
            body_start: 0,
        }
    }

    /// Split raw bytes at the first blank line. A message with no blank line
    /// is treated as all headers and an empty body, which is what the IMAP
    /// projection wants for truncated input.
    pub fn parse(raw: Vec<u8>) -> Result<Self, MimeError> {
        let body_start = find_body_start(&raw).unwrap_or(raw.len());
        Ok(Self {
            prepended: Vec::new(),
            raw,
            body_start,
        })
    }

    /// Prepend a header in front of the original header block.
    pub fn prepend(&mut self, name: &str, value: &str) {
        self.prepended.push((name.to_string(), value.to_string()));
    }

    /// First value of the named header, unfolded, checking prepended headers
    /// before the original ones. Name comparison is case-insensitive.
    pub fn header(&self, name: &str) -> Option<String> {
        for (n, v) in &self.prepended {
            if n.eq_ignore_ascii_case(name) {
                return Some(v.clone());
            }
        }
        self.headers()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All original headers in order, unfolded.
    pub fn headers(&self) -> Vec<(String, String)> {
        parse_headers(&self.raw[..self.body_start])
    }

    /// Serialize: prepended headers first, then the original bytes untouched.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + self.prepended.len() * 64);
        for (name, value) in &self.prepended {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(&self.raw);
        out
    }

    /// The header section including the terminating blank line.
    pub fn header_bytes(&self) -> &[u8] {
        &self.raw[..self.body_start]
    }

    /// The body, after the blank line.
    pub fn body_bytes(&self) -> &[u8] {
        &self.raw[self.body_start..]
    }
}

/// Offset of the first byte after the header/body separator, tolerating both
/// CRLF and bare LF line endings.
fn find_body_start(raw: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            if raw[i + 1..].starts_with(b"\r\n") {
                return Some(i + 3);
            }
            if raw[i + 1..].starts_with(b"\n") {
                return Some(i + 2);
            }
        }
        i += 1;
    }
    None
}

/// Offset of a MIME part's body within its raw bytes. A part may begin
/// directly with its blank line when it has no headers at all.
pub(crate) fn find_part_body_start(part: &[u8]) -> usize {
    if part.starts_with(b"\r\n") {
        return 2;
    }
    if part.starts_with(b"\n") {
        return 1;
    }
    find_body_start(part).unwrap_or(part.len())
}

/// Parse a header block into (name, unfolded value) pairs. Continuation
/// lines (leading space or tab) are joined with a single space.
pub fn parse_headers(block: &[u8]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in split_lines(block) {
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(last) = out.last_mut() {
                let cont = String::from_utf8_lossy(line).trim().to_string();
                if !cont.is_empty() {
                    last.1.push(' ');
                    last.1.push_str(&cont);
                }
            }
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
        out.push((name, value));
    }
    out
}

/// Split into lines without their terminators, tolerating CRLF and LF.
fn split_lines(block: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in block.iter().enumerate() {
        if b == b'\n' {
            let mut end = i;
            if end > start && block[end - 1] == b'\r' {
                end -= 1;
            }
            out.push(&block[start..end]);
            start = i + 1;
        }
    }
    if start < block.len() {
        out.push(&block[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"From: a@yggmail\r\nSubject: hello\r\n world\r\nTo: b@yggmail\r\n\r\nbody text\r\n";

    #[test]
    fn splits_headers_and_body() {
        let m = Message::parse(SAMPLE.to_vec()).unwrap();
        assert_eq!(m.body_bytes(), b"body text\r\n");
        assert_eq!(m.header("subject").as_deref(), Some("hello world"));
        assert_eq!(m.header("From").as_deref(), Some("a@yggmail"));
        assert_eq!(m.header("Date"), None);
    }

    #[test]
    fn prepended_headers_serialize_first() {
        let mut m = Message::parse(SAMPLE.to_vec()).unwrap();
        m.prepend("Received", "from x by Yggmail y; now");
        let out = m.to_bytes();
        assert!(out.starts_with(b"Received: from x by Yggmail y; now\r\n"));
        assert!(out.ends_with(SAMPLE));
        assert_eq!(m.header("Received").as_deref(), Some("from x by Yggmail y; now"));
    }

    #[test]
    fn tolerates_bare_lf() {
        let m = Message::parse(b"A: 1\nB: 2\n\nbody".to_vec()).unwrap();
        assert_eq!(m.header("B").as_deref(), Some("2"));
        assert_eq!(m.body_bytes(), b"body");
    }

    #[test]
    fn no_blank_line_means_empty_body() {
        let m = Message::parse(b"A: 1\r\nB: 2\r\n".to_vec()).unwrap();
        assert_eq!(m.body_bytes(), b"");
        assert_eq!(m.header("A").as_deref(), Some("1"));
    }
}
