/*
 * command.rs
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

//! IMAP command parsing: tag, verb and arguments tokenized from the line
//! fragments and literals the reader collected. Atoms keep their bracketed
//! sections intact (`BODY[HEADER.FIELDS (FROM TO)]` is one token), quoted
//! strings unescape, literals stay bytes. Also the sequence-set grammar.

/// A piece of one command as read off the wire.
#[derive(Debug)]
pub enum Part {
    /// A text fragment (a command line, or what follows a literal).
    Line(String),
    /// One `{n}` literal's raw bytes.
    Literal(Vec<u8>),
}

/// One parsed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    Str(String),
    Bytes(Vec<u8>),
    LParen,
    RParen,
}

impl Token {
    /// The token as text, for arguments that are strings whichever way the
    /// client chose to send them.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Token::Atom(s) | Token::Str(s) => Some(s.clone()),
            Token::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Command {
    pub tag: String,
    pub name: String,
    pub args: Vec<Token>,
}

/// Parse the collected parts into a command. NIL atoms stay atoms; the
/// dispatcher decides what they mean in context.
pub fn parse_command(parts: &[Part]) -> Result<Command, String> {
    let mut tokens = Vec::new();
    for part in parts {
        match part {
            Part::Line(line) => tokenize_line(line, &mut tokens)?,
            Part::Literal(bytes) => tokens.push(Token::Bytes(bytes.clone())),
        }
    }
    let mut tokens = tokens.into_iter();
    let tag = match tokens.next() {
        Some(Token::Atom(tag)) => tag,
        _ => return Err("missing command tag".to_string()),
    };
    let name = match tokens.next() {
        Some(Token::Atom(name)) => name.to_ascii_uppercase(),
        _ => return Err("missing command name".to_string()),
    };
    Ok(Command {
        tag,
        name,
        args: tokens.collect(),
    })
}

fn tokenize_line(line: &str, out: &mut Vec<Token>) -> Result<(), String> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b'(' => {
                out.push(Token::LParen);
                i += 1;
            }
            b')' => {
                out.push(Token::RParen);
                i += 1;
            }
            b'"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err("unterminated quoted string".to_string());
                    }
                    match bytes[i] {
                        b'"' => {
                            i += 1;
                            break;
                        }
                        b'\\' if i + 1 < bytes.len() => {
                            value.push(bytes[i + 1] as char);
                            i += 2;
                        }
                        b => {
                            value.push(b as char);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Str(value));
            }
            _ => {
                // Atom; a '[' pulls everything up to the matching ']' in,
                // spaces and parentheses included.
                let start = i;
                let mut depth = 0usize;
                while i < bytes.len() {
                    let b = bytes[i];
                    if depth == 0 && (b == b' ' || b == b'\t' || b == b'(' || b == b')') {
                        break;
                    }
                    if b == b'[' {
                        depth += 1;
                    } else if b == b']' {
                        depth = depth.saturating_sub(1);
                    }
                    i += 1;
                }
                let atom = &line[start..i];
                // A trailing literal marker belongs to the reader, not us.
                if !(atom.starts_with('{') && atom.ends_with('}')) {
                    out.push(Token::Atom(atom.to_string()));
                }
            }
        }
    }
    Ok(())
}

/// One element of a sequence set; 0 stands for `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqItem {
    Single(u32),
    Range(u32, u32),
}

/// Parse `1:5,7,9:*` and friends. None on malformed input.
pub fn parse_sequence_set(s: &str) -> Option<Vec<SeqItem>> {
    let mut out = Vec::new();
    for piece in s.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            return None;
        }
        match piece.split_once(':') {
            Some((a, b)) => {
                out.push(SeqItem::Range(parse_seq_number(a)?, parse_seq_number(b)?));
            }
            None => out.push(SeqItem::Single(parse_seq_number(piece)?)),
        }
    }
    Some(out)
}

fn parse_seq_number(s: &str) -> Option<u32> {
    if s == "*" {
        return Some(0);
    }
    s.parse().ok().filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> Command {
        parse_command(&[Part::Line(line.to_string())]).unwrap()
    }

    #[test]
    fn simple_command() {
        let cmd = parse_line("a001 LOGIN user pass");
        assert_eq!(cmd.tag, "a001");
        assert_eq!(cmd.name, "LOGIN");
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.args[0], Token::Atom("user".to_string()));
    }

    #[test]
    fn quoted_arguments() {
        let cmd = parse_line("a002 LOGIN \"us er\" \"pa\\\"ss\"");
        assert_eq!(cmd.args[0], Token::Str("us er".to_string()));
        assert_eq!(cmd.args[1], Token::Str("pa\"ss".to_string()));
    }

    #[test]
    fn bracketed_atom_stays_whole() {
        let cmd = parse_line("f1 FETCH 1:* (FLAGS BODY[HEADER.FIELDS (FROM TO)])");
        assert_eq!(cmd.name, "FETCH");
        assert_eq!(cmd.args[0], Token::Atom("1:*".to_string()));
        assert_eq!(cmd.args[1], Token::LParen);
        assert_eq!(cmd.args[2], Token::Atom("FLAGS".to_string()));
        assert_eq!(
            cmd.args[3],
            Token::Atom("BODY[HEADER.FIELDS (FROM TO)]".to_string())
        );
        assert_eq!(cmd.args[4], Token::RParen);
    }

    #[test]
    fn literal_becomes_bytes() {
        let cmd = parse_command(&[
            Part::Line("a003 LOGIN {4}".to_string()),
            Part::Literal(b"user".to_vec()),
            Part::Line(" secret".to_string()),
        ])
        .unwrap();
        assert_eq!(cmd.args[0], Token::Bytes(b"user".to_vec()));
        assert_eq!(cmd.args[1], Token::Atom("secret".to_string()));
    }

    #[test]
    fn sequence_sets() {
        assert_eq!(
            parse_sequence_set("1:5,7").unwrap(),
            vec![SeqItem::Range(1, 5), SeqItem::Single(7)]
        );
        assert_eq!(parse_sequence_set("*").unwrap(), vec![SeqItem::Single(0)]);
        assert_eq!(
            parse_sequence_set("3:*").unwrap(),
            vec![SeqItem::Range(3, 0)]
        );
        assert!(parse_sequence_set("nope").is_none());
        assert!(parse_sequence_set("0").is_none());
    }
}
