/*
 * dot_stuffer.rs
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

//! SMTP DATA transparency (RFC 5321 §4.5.2): on send, any line starting
//! with `.` gets an extra `.`; on receive, a leading `..` drops one dot.
//! The drainer buffers whole messages, so stuffing is a single pass here
//! rather than a streaming state machine.

/// Dot-stuff a complete message and append the `CRLF.CRLF` terminator.
/// The message is given its final CRLF first if it lacks one.
pub fn stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 8);
    let mut line_start = true;
    for &b in message {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        if out.ends_with(b"\r") {
            out.push(b'\n');
        } else {
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Undo stuffing for one received DATA line (terminator already stripped).
pub fn unstuff_line(line: &[u8]) -> &[u8] {
    if line.starts_with(b"..") {
        &line[1..]
    } else {
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_gets_terminator() {
        assert_eq!(stuff(b"Hello\r\nWorld\r\n"), b"Hello\r\nWorld\r\n.\r\n");
    }

    #[test]
    fn missing_final_newline_is_added() {
        assert_eq!(stuff(b"Hello"), b"Hello\r\n.\r\n");
    }

    #[test]
    fn leading_dots_are_doubled() {
        assert_eq!(stuff(b".\r\n"), b"..\r\n.\r\n");
        assert_eq!(stuff(b"a\r\n.b\r\n"), b"a\r\n..b\r\n.\r\n");
    }

    #[test]
    fn dots_mid_line_untouched() {
        assert_eq!(stuff(b"a.b\r\n"), b"a.b\r\n.\r\n");
    }

    #[test]
    fn unstuff_drops_one_dot() {
        assert_eq!(unstuff_line(b"..x"), b".x");
        assert_eq!(unstuff_line(b".x"), b".x");
        assert_eq!(unstuff_line(b"x"), b"x");
    }
}
