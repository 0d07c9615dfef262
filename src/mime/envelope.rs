/*
 * envelope.rs
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

//! Envelope projection for IMAP FETCH: the addressing headers of a message
//! reduced to the ENVELOPE shape. Address parsing covers the forms that
//! occur in practice (bare addr-spec, `Display Name <addr>`, quoted display
//! names, comma-separated lists); exotic obsolete syntax is out.

use crate::mime::Message;

/// One parsed mailbox: display name plus addr-spec halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub mailbox: String,
    pub host: String,
}

/// The IMAP ENVELOPE fields, taken verbatim from the headers.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<MailAddress>,
    pub sender: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// Project a message's headers onto the ENVELOPE shape. Sender and Reply-To
/// default to From when absent, as RFC 3501 requires.
pub fn envelope_of(message: &Message) -> Envelope {
    let from = address_list(message.header("From"));
    let sender = match address_list(message.header("Sender")) {
        v if v.is_empty() => from.clone(),
        v => v,
    };
    let reply_to = match address_list(message.header("Reply-To")) {
        v if v.is_empty() => from.clone(),
        v => v,
    };
    Envelope {
        date: message.header("Date"),
        subject: message.header("Subject"),
        from,
        sender,
        reply_to,
        to: address_list(message.header("To")),
        cc: address_list(message.header("Cc")),
        bcc: address_list(message.header("Bcc")),
        in_reply_to: message.header("In-Reply-To"),
        message_id: message.header("Message-Id"),
    }
}

fn address_list(value: Option<String>) -> Vec<MailAddress> {
    value.map(|v| parse_address_list(&v)).unwrap_or_default()
}

/// Parse a comma-separated address list. Commas inside quoted strings and
/// angle brackets do not split.
pub fn parse_address_list(value: &str) -> Vec<MailAddress> {
    let mut out = Vec::new();
    let mut depth_angle = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    let bytes = value.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'<' if !in_quotes => depth_angle += 1,
            b'>' if !in_quotes => depth_angle = depth_angle.saturating_sub(1),
            b',' if !in_quotes && depth_angle == 0 => {
                if let Some(addr) = parse_one_address(&value[start..i]) {
                    out.push(addr);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if let Some(addr) = parse_one_address(&value[start..]) {
        out.push(addr);
    }
    out
}

/// Parse one mailbox: `addr@host`, `<addr@host>`, or `Name <addr@host>`.
fn parse_one_address(raw: &str) -> Option<MailAddress> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (name, spec) = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = raw[..open].trim().trim_matches('"').trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
            (name, raw[open + 1..close].trim())
        }
        _ => (None, raw),
    };
    let at = spec.rfind('@');
    match at {
        Some(at) if at > 0 => Some(MailAddress {
            name,
            mailbox: spec[..at].to_string(),
            host: spec[at + 1..].to_string(),
        }),
        _ => Some(MailAddress {
            name,
            mailbox: spec.to_string(),
            host: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_named_addresses() {
        let list = parse_address_list("a@yggmail, Bob <b@yggmail>, \"C, D\" <c@yggmail>");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].mailbox, "a");
        assert_eq!(list[0].host, "yggmail");
        assert_eq!(list[0].name, None);
        assert_eq!(list[1].name.as_deref(), Some("Bob"));
        assert_eq!(list[1].mailbox, "b");
        assert_eq!(list[2].name.as_deref(), Some("C, D"));
        assert_eq!(list[2].mailbox, "c");
    }

    #[test]
    fn envelope_defaults_sender_to_from() {
        let raw = b"From: a@yggmail\r\nTo: b@yggmail\r\nSubject: s\r\n\r\n".to_vec();
        let m = Message::parse(raw).unwrap();
        let env = envelope_of(&m);
        assert_eq!(env.from.len(), 1);
        assert_eq!(env.sender, env.from);
        assert_eq!(env.reply_to, env.from);
        assert_eq!(env.subject.as_deref(), Some("s"));
        assert!(env.cc.is_empty());
    }
}
