/*
 * body.rs
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

//! Content-Type parsing and BODYSTRUCTURE projection. Multipart messages
//! are split on their boundary and projected recursively; everything else
//! is a single part described by its Content-Type headers and size.

use crate::mime::{parse_headers, Message};

/// Parsed Content-Type: type/subtype plus parameters.
#[derive(Debug, Clone)]
pub struct ContentType {
    pub ctype: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
}

impl ContentType {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.ctype.eq_ignore_ascii_case("multipart")
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            ctype: "text".to_string(),
            subtype: "plain".to_string(),
            params: vec![("charset".to_string(), "us-ascii".to_string())],
        }
    }
}

/// Parse a Content-Type header value, e.g.
/// `multipart/mixed; boundary="xyz"`. Missing or unparsable values yield
/// the RFC 2045 default, text/plain us-ascii.
pub fn parse_content_type(value: Option<&str>) -> ContentType {
    let Some(value) = value else {
        return ContentType::default();
    };
    let mut segments = value.split(';');
    let Some(main) = segments.next() else {
        return ContentType::default();
    };
    let mut halves = main.trim().splitn(2, '/');
    let ctype = halves.next().unwrap_or("").trim().to_ascii_lowercase();
    let subtype = halves.next().unwrap_or("").trim().to_ascii_lowercase();
    if ctype.is_empty() || subtype.is_empty() {
        return ContentType::default();
    }
    let mut params = Vec::new();
    for segment in segments {
        let mut kv = segment.splitn(2, '=');
        let name = kv.next().unwrap_or("").trim().to_ascii_lowercase();
        let value = kv.next().unwrap_or("").trim().trim_matches('"').to_string();
        if !name.is_empty() {
            params.push((name, value));
        }
    }
    ContentType {
        ctype,
        subtype,
        params,
    }
}

/// One node of the BODYSTRUCTURE tree.
#[derive(Debug, Clone)]
pub struct BodyStructure {
    pub content_type: ContentType,
    pub content_id: Option<String>,
    pub description: Option<String>,
    pub encoding: String,
    pub size: usize,
    pub lines: usize,
    pub parts: Vec<BodyStructure>,
}

/// Project a stored message onto its BODYSTRUCTURE.
pub fn body_structure(message: &Message) -> BodyStructure {
    structure_of(message.header_bytes(), message.body_bytes())
}

fn structure_of(header_block: &[u8], body: &[u8]) -> BodyStructure {
    let headers = parse_headers(header_block);
    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    let content_type = parse_content_type(find("Content-Type").as_deref());
    let encoding = find("Content-Transfer-Encoding").unwrap_or_else(|| "7bit".to_string());

    let mut parts = Vec::new();
    if content_type.is_multipart() {
        if let Some(boundary) = content_type.param("boundary") {
            for part in split_multipart(body, boundary) {
                let split = part_body_start(part);
                parts.push(structure_of(&part[..split], &part[split..]));
            }
        }
    }

    BodyStructure {
        content_type,
        content_id: find("Content-Id"),
        description: find("Content-Description"),
        encoding,
        size: body.len(),
        lines: count_lines(body),
        parts,
    }
}

/// Extract the numbered part (1-based) of a multipart body, returning its
/// raw bytes (headers + body). None when the message is not multipart or
/// the index is out of range; part 1 of a non-multipart message is the
/// message body itself, per RFC 3501.
pub fn part_bytes(message: &Message, index: usize) -> Option<Vec<u8>> {
    let content_type = parse_content_type(message.header("Content-Type").as_deref());
    if !content_type.is_multipart() {
        return (index == 1).then(|| message.body_bytes().to_vec());
    }
    let boundary = content_type.param("boundary")?;
    let parts = split_multipart(message.body_bytes(), boundary);
    parts.get(index.checked_sub(1)?).map(|p| {
        let split = part_body_start(p);
        p[split..].to_vec()
    })
}

/// Split a multipart body on its boundary, returning each part's raw bytes.
pub fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{}", boundary);
    let close = format!("--{}--", boundary);
    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut offset = 0;
    for line_end in line_ends(body) {
        let line = trim_line(&body[offset..line_end]);
        if line == close.as_bytes() || line == delim.as_bytes() {
            if let Some(start) = current.take() {
                // strip the CRLF that belongs to the boundary line
                let mut end = offset;
                if end > start && body[end - 1] == b'\n' {
                    end -= 1;
                    if end > start && body[end - 1] == b'\r' {
                        end -= 1;
                    }
                }
                parts.push(&body[start..end]);
            }
            if line == delim.as_bytes() {
                current = Some(line_end);
            }
        }
        offset = line_end;
    }
    parts
}

fn part_body_start(part: &[u8]) -> usize {
    super::find_part_body_start(part)
}

fn line_ends(body: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, &b) in body.iter().enumerate() {
        if b == b'\n' {
            out.push(i + 1);
        }
    }
    if body.last().map(|&b| b != b'\n').unwrap_or(false) {
        out.push(body.len());
    }
    out
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn count_lines(body: &[u8]) -> usize {
    body.iter().filter(|&&b| b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_defaults() {
        let ct = parse_content_type(None);
        assert_eq!(ct.ctype, "text");
        assert_eq!(ct.subtype, "plain");
        assert_eq!(ct.param("charset"), Some("us-ascii"));
    }

    #[test]
    fn content_type_with_params() {
        let ct = parse_content_type(Some("multipart/Mixed; boundary=\"b42\"; x=y"));
        assert!(ct.is_multipart());
        assert_eq!(ct.subtype, "mixed");
        assert_eq!(ct.param("boundary"), Some("b42"));
        assert_eq!(ct.param("X"), Some("y"));
    }

    const MULTIPART: &[u8] = b"From: a@yggmail\r\n\
Content-Type: multipart/mixed; boundary=\"b42\"\r\n\
\r\n\
preamble\r\n\
--b42\r\n\
Content-Type: text/plain\r\n\
\r\n\
first part\r\n\
--b42\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>second</p>\r\n\
--b42--\r\n";

    #[test]
    fn multipart_structure() {
        let m = Message::parse(MULTIPART.to_vec()).unwrap();
        let bs = body_structure(&m);
        assert!(bs.content_type.is_multipart());
        assert_eq!(bs.parts.len(), 2);
        assert_eq!(bs.parts[0].content_type.subtype, "plain");
        assert_eq!(bs.parts[1].content_type.subtype, "html");
    }

    #[test]
    fn part_extraction() {
        let m = Message::parse(MULTIPART.to_vec()).unwrap();
        assert_eq!(part_bytes(&m, 1).unwrap(), b"first part");
        assert_eq!(part_bytes(&m, 2).unwrap(), b"<p>second</p>");
        assert!(part_bytes(&m, 3).is_none());
    }

    #[test]
    fn single_part_one_is_body() {
        let m = Message::parse(b"A: 1\r\n\r\nhello\r\n".to_vec()).unwrap();
        assert_eq!(part_bytes(&m, 1).unwrap(), b"hello\r\n");
        let bs = body_structure(&m);
        assert!(bs.parts.is_empty());
        assert_eq!(bs.size, 7);
    }
}
