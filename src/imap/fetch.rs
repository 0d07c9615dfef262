/*
 * fetch.rs
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

//! FETCH projection: stored bytes parsed as RFC 5322 and rendered item by
//! item — flags, dates, envelope, body structure, body sections with
//! partial ranges. Section data goes out as IMAP literals, so the rendered
//! response is bytes, not text.

use crate::mime::body::{body_structure, part_bytes, BodyStructure};
use crate::mime::datetime::format_internal_date;
use crate::mime::envelope::{envelope_of, Envelope, MailAddress};
use crate::mime::Message;
use crate::storage::Mail;

/// One requested fetch item, normalized.
#[derive(Debug, Clone)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    Body,
    BodyStructure,
    /// BODY[<section>]<<partial>>; peek suppresses the \Seen side effect.
    Section {
        spec: String,
        peek: bool,
        partial: Option<(usize, usize)>,
    },
}

/// Expand macros and parse the request's item atoms.
pub fn parse_items(atoms: &[String]) -> Vec<FetchItem> {
    let mut out = Vec::new();
    for atom in atoms {
        let upper = atom.to_ascii_uppercase();
        match upper.as_str() {
            "ALL" => {
                out.extend([
                    FetchItem::Flags,
                    FetchItem::InternalDate,
                    FetchItem::Rfc822Size,
                    FetchItem::Envelope,
                ]);
            }
            "FAST" => {
                out.extend([
                    FetchItem::Flags,
                    FetchItem::InternalDate,
                    FetchItem::Rfc822Size,
                ]);
            }
            "FULL" => {
                out.extend([
                    FetchItem::Flags,
                    FetchItem::InternalDate,
                    FetchItem::Rfc822Size,
                    FetchItem::Envelope,
                    FetchItem::Body,
                ]);
            }
            "UID" => out.push(FetchItem::Uid),
            "FLAGS" => out.push(FetchItem::Flags),
            "INTERNALDATE" => out.push(FetchItem::InternalDate),
            "RFC822.SIZE" => out.push(FetchItem::Rfc822Size),
            "ENVELOPE" => out.push(FetchItem::Envelope),
            "BODY" => out.push(FetchItem::Body),
            "BODYSTRUCTURE" => out.push(FetchItem::BodyStructure),
            "RFC822" => out.push(FetchItem::Section {
                spec: String::new(),
                peek: false,
                partial: None,
            }),
            "RFC822.HEADER" => out.push(FetchItem::Section {
                spec: "HEADER".to_string(),
                peek: true,
                partial: None,
            }),
            "RFC822.TEXT" => out.push(FetchItem::Section {
                spec: "TEXT".to_string(),
                peek: false,
                partial: None,
            }),
            _ => {
                if let Some(section) = parse_section_item(atom) {
                    out.push(section);
                }
            }
        }
    }
    out
}

/// Parse `BODY[...]` / `BODY.PEEK[...]` with an optional `<start.count>`.
fn parse_section_item(atom: &str) -> Option<FetchItem> {
    let upper = atom.to_ascii_uppercase();
    let peek = upper.starts_with("BODY.PEEK[");
    if !peek && !upper.starts_with("BODY[") {
        return None;
    }
    let open = atom.find('[')?;
    let close = atom.rfind(']')?;
    if close < open {
        return None;
    }
    let spec = atom[open + 1..close].to_string();
    let partial = atom[close + 1..]
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .and_then(|inner| {
            let (start, count) = inner.split_once('.')?;
            Some((start.parse().ok()?, count.parse().ok()?))
        });
    Some(FetchItem::Section {
        spec,
        peek,
        partial,
    })
}

/// Does any requested item imply setting \Seen?
pub fn wants_mark_seen(items: &[FetchItem]) -> bool {
    items
        .iter()
        .any(|i| matches!(i, FetchItem::Section { peek: false, .. }))
}

/// Render one message's FETCH response, e.g.
/// `* 3 FETCH (UID 7 FLAGS (\Seen))`. Returns raw bytes because body
/// sections embed literals.
pub fn render_fetch(seq: u32, mail: &Mail, items: &[FetchItem], force_uid: bool) -> Vec<u8> {
    // Unparsable stored bytes still have flags and a size.
    let message = Message::parse(mail.mail.clone()).unwrap_or_else(|_| Message::empty());

    let mut fields: Vec<Vec<u8>> = Vec::new();
    let mut uid_included = false;
    for item in items {
        match item {
            FetchItem::Uid => {
                if !uid_included {
                    fields.push(format!("UID {}", mail.id).into_bytes());
                    uid_included = true;
                }
            }
            FetchItem::Flags => {
                fields.push(format!("FLAGS {}", render_flags(mail)).into_bytes());
            }
            FetchItem::InternalDate => {
                fields.push(
                    format!("INTERNALDATE \"{}\"", format_internal_date(mail.datetime))
                        .into_bytes(),
                );
            }
            FetchItem::Rfc822Size => {
                fields.push(format!("RFC822.SIZE {}", mail.mail.len()).into_bytes());
            }
            FetchItem::Envelope => {
                fields.push(
                    format!("ENVELOPE {}", render_envelope(&envelope_of(&message))).into_bytes(),
                );
            }
            FetchItem::Body => {
                fields.push(
                    format!("BODY {}", render_body_structure(&body_structure(&message)))
                        .into_bytes(),
                );
            }
            FetchItem::BodyStructure => {
                fields.push(
                    format!(
                        "BODYSTRUCTURE {}",
                        render_body_structure(&body_structure(&message))
                    )
                    .into_bytes(),
                );
            }
            FetchItem::Section {
                spec,
                partial,
                ..
            } => {
                let mut data = section_bytes(&mail.mail, &message, spec);
                let label = if let Some((start, count)) = partial {
                    let start = (*start).min(data.len());
                    let end = start.saturating_add(*count).min(data.len());
                    data = data[start..end].to_vec();
                    format!("BODY[{}]<{}>", spec, start)
                } else {
                    format!("BODY[{}]", spec)
                };
                let mut field = format!("{} {{{}}}\r\n", label, data.len()).into_bytes();
                field.extend_from_slice(&data);
                fields.push(field);
            }
        }
    }
    if force_uid && !uid_included {
        fields.push(format!("UID {}", mail.id).into_bytes());
    }

    let mut out = format!("* {} FETCH (", seq).into_bytes();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(field);
    }
    out.extend_from_slice(b")\r\n");
    out
}

pub fn render_flags(mail: &Mail) -> String {
    let mut flags = Vec::new();
    if mail.seen {
        flags.push("\\Seen");
    }
    if mail.answered {
        flags.push("\\Answered");
    }
    if mail.flagged {
        flags.push("\\Flagged");
    }
    if mail.deleted {
        flags.push("\\Deleted");
    }
    format!("({})", flags.join(" "))
}

/// Extract one section's bytes: whole message, HEADER, TEXT,
/// HEADER.FIELDS (...), or a dotted part path with optional trailing
/// HEADER/TEXT.
fn section_bytes(raw: &[u8], message: &Message, spec: &str) -> Vec<u8> {
    let spec = spec.trim();
    if spec.is_empty() {
        return raw.to_vec();
    }
    let upper = spec.to_ascii_uppercase();
    if upper == "HEADER" {
        return message.header_bytes().to_vec();
    }
    if upper == "TEXT" {
        return message.body_bytes().to_vec();
    }
    if upper.starts_with("HEADER.FIELDS") {
        let negate = upper.starts_with("HEADER.FIELDS.NOT");
        let names: Vec<String> = spec
            .find('(')
            .and_then(|open| spec.rfind(')').map(|close| &spec[open + 1..close]))
            .map(|inner| {
                inner
                    .split_whitespace()
                    .map(|s| s.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let mut out = Vec::new();
        for (name, value) in message.headers() {
            let selected = names.contains(&name.to_ascii_lowercase());
            if selected != negate {
                out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        return out;
    }
    if spec.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return numbered_section(message, spec);
    }
    Vec::new()
}

/// Walk a dotted part path like `2.1` or `1.TEXT`.
fn numbered_section(message: &Message, spec: &str) -> Vec<u8> {
    let mut current = message.clone();
    let mut components = spec.split('.').peekable();
    while let Some(component) = components.next() {
        if let Ok(index) = component.parse::<usize>() {
            match part_bytes(&current, index) {
                Some(bytes) => match Message::parse(bytes) {
                    Ok(next) => current = next,
                    Err(_) => return Vec::new(),
                },
                None => return Vec::new(),
            }
            continue;
        }
        let upper = component.to_ascii_uppercase();
        let trailing = components.peek().is_none();
        if trailing && upper == "HEADER" {
            return current.header_bytes().to_vec();
        }
        if trailing && upper == "TEXT" {
            return current.body_bytes().to_vec();
        }
        return Vec::new();
    }
    // A bare part number: its content.
    let mut out = current.header_bytes().to_vec();
    out.extend_from_slice(current.body_bytes());
    out
}

fn quote(s: &str) -> String {
    let cleaned: String = s.chars().filter(|&c| c != '\r' && c != '\n').collect();
    format!(
        "\"{}\"",
        cleaned.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

fn nstring(value: &Option<String>) -> String {
    match value {
        Some(s) => quote(s),
        None => "NIL".to_string(),
    }
}

fn render_address_list(list: &[MailAddress]) -> String {
    if list.is_empty() {
        return "NIL".to_string();
    }
    let rendered: Vec<String> = list
        .iter()
        .map(|a| {
            format!(
                "({} NIL {} {})",
                nstring(&a.name),
                quote(&a.mailbox),
                if a.host.is_empty() {
                    "NIL".to_string()
                } else {
                    quote(&a.host)
                }
            )
        })
        .collect();
    format!("({})", rendered.join(""))
}

pub fn render_envelope(env: &Envelope) -> String {
    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        nstring(&env.date),
        nstring(&env.subject),
        render_address_list(&env.from),
        render_address_list(&env.sender),
        render_address_list(&env.reply_to),
        render_address_list(&env.to),
        render_address_list(&env.cc),
        render_address_list(&env.bcc),
        nstring(&env.in_reply_to),
        nstring(&env.message_id),
    )
}

pub fn render_body_structure(bs: &BodyStructure) -> String {
    if bs.content_type.is_multipart() {
        let parts: String = bs.parts.iter().map(render_body_structure).collect();
        return format!("({} {})", parts, quote(&bs.content_type.subtype));
    }
    let params = if bs.content_type.params.is_empty() {
        "NIL".to_string()
    } else {
        let rendered: Vec<String> = bs
            .content_type
            .params
            .iter()
            .map(|(k, v)| format!("{} {}", quote(k), quote(v)))
            .collect();
        format!("({})", rendered.join(" "))
    };
    let mut out = format!(
        "({} {} {} {} {} {} {}",
        quote(&bs.content_type.ctype),
        quote(&bs.content_type.subtype),
        params,
        nstring(&bs.content_id),
        nstring(&bs.description),
        quote(&bs.encoding),
        bs.size,
    );
    if bs.content_type.ctype.eq_ignore_ascii_case("text") {
        out.push_str(&format!(" {}", bs.lines));
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mail() -> Mail {
        Mail {
            mailbox: "INBOX".to_string(),
            id: 7,
            mail: b"From: Someone <a@yggmail>\r\nTo: b@yggmail\r\nSubject: greetings\r\nDate: Fri, 21 Nov 1997 09:55:06 -0600\r\n\r\nhello body\r\n"
                .to_vec(),
            datetime: 837571465,
            seen: true,
            answered: false,
            flagged: false,
            deleted: false,
        }
    }

    #[test]
    fn renders_flags_and_uid() {
        let mail = sample_mail();
        let items = parse_items(&["FLAGS".to_string(), "UID".to_string()]);
        let out = render_fetch(3, &mail, &items, false);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "* 3 FETCH (FLAGS (\\Seen) UID 7)\r\n");
    }

    #[test]
    fn renders_envelope_fields() {
        let mail = sample_mail();
        let items = parse_items(&["ENVELOPE".to_string()]);
        let out = String::from_utf8(render_fetch(1, &mail, &items, false)).unwrap();
        assert!(out.contains("\"greetings\""));
        assert!(out.contains("\"Someone\""));
        assert!(out.contains("\"a\" \"yggmail\""));
    }

    #[test]
    fn body_text_section_is_literal() {
        let mail = sample_mail();
        let items = parse_items(&["BODY[TEXT]".to_string()]);
        let out = render_fetch(1, &mail, &items, false);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("* 1 FETCH (BODY[TEXT] {12}\r\n"));
        assert!(text.contains("hello body"));
        assert!(wants_mark_seen(&items));
    }

    #[test]
    fn peek_does_not_mark_seen() {
        let items = parse_items(&["BODY.PEEK[HEADER]".to_string()]);
        assert!(!wants_mark_seen(&items));
        match &items[0] {
            FetchItem::Section { spec, peek, .. } => {
                assert_eq!(spec, "HEADER");
                assert!(peek);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn partial_section_slices() {
        let mail = sample_mail();
        let items = parse_items(&["BODY.PEEK[TEXT]<0.5>".to_string()]);
        let out = String::from_utf8(render_fetch(1, &mail, &items, false)).unwrap();
        assert!(out.contains("BODY[TEXT]<0> {5}\r\nhello"));
    }

    #[test]
    fn header_fields_filter() {
        let mail = sample_mail();
        let items = parse_items(&["BODY.PEEK[HEADER.FIELDS (SUBJECT)]".to_string()]);
        let out = String::from_utf8(render_fetch(1, &mail, &items, false)).unwrap();
        assert!(out.contains("Subject: greetings\r\n"));
        assert!(!out.contains("To: b@yggmail"));
    }

    #[test]
    fn uid_fetch_always_includes_uid() {
        let mail = sample_mail();
        let items = parse_items(&["FLAGS".to_string()]);
        let out = String::from_utf8(render_fetch(2, &mail, &items, true)).unwrap();
        assert!(out.contains("UID 7"));
    }
}
