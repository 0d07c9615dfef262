/*
 * server.rs
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

//! SMTP server state machine: greeting, EHLO, optional AUTH (LOGIN and
//! PLAIN), MAIL, RCPT, DATA, RSET, NOOP, QUIT. The backend supplies the
//! semantics; this module only speaks the wire protocol, mirroring the
//! client on the other side of the dialogue.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::smtp::dot_stuffer;
use crate::smtp::SmtpError;

/// Per-listener server settings.
#[derive(Debug, Clone)]
pub struct SmtpServerConfig {
    /// Our advertised domain: the hex of the local public key.
    pub domain: String,
    /// Whether AUTH is offered and required (the loopback submission face).
    /// The overlay face disables it: the transport already authenticated.
    pub auth_enabled: bool,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl SmtpServerConfig {
    pub fn new(domain: String, auth_enabled: bool) -> Self {
        Self {
            domain,
            auth_enabled,
            max_message_bytes: 32 * 1024 * 1024,
            max_recipients: 50,
        }
    }
}

/// One accepted mail transaction backend; holds MAIL/RCPT state between
/// commands and performs delivery at DATA.
#[allow(async_fn_in_trait)]
pub trait SmtpSession: Send {
    async fn mail(&mut self, from: &str) -> Result<(), SmtpError>;
    async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError>;
    async fn data(&mut self, raw: Vec<u8>) -> Result<(), SmtpError>;
    fn reset(&mut self);
}

/// Produces sessions for accepted connections: authenticated on the local
/// face, anonymous (transport-authenticated) on the overlay face.
#[allow(async_fn_in_trait)]
pub trait SmtpBackend: Send + Sync {
    type Session: SmtpSession;

    async fn login(
        &self,
        remote: &str,
        username: &str,
        password: &str,
    ) -> Result<Self::Session, SmtpError>;

    async fn anonymous(&self, remote: &str) -> Result<Self::Session, SmtpError>;
}

/// Drive one connection to completion. `remote` is the peer identity
/// string: a socket address on the local face, a hex public key on the
/// overlay face.
pub async fn serve_connection<B, S>(
    backend: &B,
    config: &SmtpServerConfig,
    stream: S,
    remote: &str,
) -> Result<(), SmtpError>
where
    B: SmtpBackend,
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut session: Option<B::Session> = if config.auth_enabled {
        None
    } else {
        Some(backend.anonymous(remote).await?)
    };

    write_reply(&mut writer, &format!("220 {} ESMTP Yggmail", config.domain)).await?;

    let mut has_mail = false;
    let mut rcpt_count = 0usize;

    loop {
        let Some(line) = read_command_line(&mut reader).await? else {
            return Ok(()); // peer hung up
        };
        let (verb, rest) = split_verb(&line);

        let outcome: Result<Option<String>, SmtpError> = match verb.as_str() {
            "HELO" => Ok(Some(format!("250 {}", config.domain))),
            "EHLO" => {
                let mut reply = format!(
                    "250-{} Hello\r\n250-SIZE {}",
                    config.domain, config.max_message_bytes
                );
                if config.auth_enabled {
                    reply.push_str("\r\n250 AUTH PLAIN LOGIN");
                } else {
                    reply.push_str("\r\n250 OK");
                }
                Ok(Some(reply))
            }
            "AUTH" if !config.auth_enabled => {
                Ok(Some("502 authentication not enabled".to_string()))
            }
            "AUTH" if session.is_some() => Ok(Some("503 already authenticated".to_string())),
            "AUTH" => match handle_auth(backend, remote, &mut reader, &mut writer, rest).await {
                Ok(s) => {
                    session = Some(s);
                    Ok(Some("235 authentication succeeded".to_string()))
                }
                Err(e) => Err(e),
            },
            "MAIL" => match session.as_mut() {
                None => Ok(Some("530 authentication required".to_string())),
                Some(s) => match parse_path(rest, "FROM:") {
                    None => Ok(Some("501 bad MAIL syntax".to_string())),
                    Some(from) => s.mail(&from).await.map(|_| {
                        has_mail = true;
                        rcpt_count = 0;
                        Some("250 OK".to_string())
                    }),
                },
            },
            "RCPT" => match session.as_mut() {
                None => Ok(Some("530 authentication required".to_string())),
                Some(_) if !has_mail => Ok(Some("503 MAIL first".to_string())),
                Some(_) if rcpt_count >= config.max_recipients => {
                    Ok(Some("452 too many recipients".to_string()))
                }
                Some(s) => match parse_path(rest, "TO:") {
                    None => Ok(Some("501 bad RCPT syntax".to_string())),
                    Some(to) => s.rcpt(&to).await.map(|_| {
                        rcpt_count += 1;
                        Some("250 OK".to_string())
                    }),
                },
            },
            "DATA" => match session.as_mut() {
                None => Ok(Some("530 authentication required".to_string())),
                Some(_) if !has_mail || rcpt_count == 0 => {
                    Ok(Some("503 MAIL and RCPT first".to_string()))
                }
                Some(s) => {
                    write_reply(&mut writer, "354 end data with <CRLF>.<CRLF>").await?;
                    match read_data(&mut reader, config.max_message_bytes).await {
                        Ok(raw) => match s.data(raw).await {
                            Ok(()) => {
                                has_mail = false;
                                rcpt_count = 0;
                                s.reset();
                                Ok(Some("250 OK: queued".to_string()))
                            }
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    }
                }
            },
            "RSET" => {
                if let Some(s) = session.as_mut() {
                    s.reset();
                }
                has_mail = false;
                rcpt_count = 0;
                Ok(Some("250 OK".to_string()))
            }
            "NOOP" => Ok(Some("250 OK".to_string())),
            "VRFY" => Ok(Some("252 send some mail, I'll try my best".to_string())),
            "QUIT" => {
                write_reply(&mut writer, "221 bye").await?;
                return Ok(());
            }
            "" => Ok(Some("500 command unrecognized".to_string())),
            _ => Ok(Some("502 command not implemented".to_string())),
        };

        match outcome {
            Ok(Some(reply)) => write_reply(&mut writer, &reply).await?,
            Ok(None) => {}
            Err(e) => {
                write_reply(&mut writer, &format!("{} {}", e.code, e.message)).await?;
                if e.fatal {
                    return Ok(());
                }
            }
        }
    }
}

/// AUTH PLAIN [initial-response] or AUTH LOGIN: run the challenge dialogue
/// and hand the decoded credentials to the backend.
async fn handle_auth<B, R, W>(
    backend: &B,
    remote: &str,
    reader: &mut BufReader<ReadHalf<R>>,
    writer: &mut WriteHalf<W>,
    rest: &str,
) -> Result<B::Session, SmtpError>
where
    B: SmtpBackend,
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let mut parts = rest.split_whitespace();
    let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
    let initial = parts.next();

    let (username, password) = match mechanism.as_str() {
        "PLAIN" => {
            let payload = match initial {
                Some(b64) => b64.to_string(),
                None => {
                    write_reply(writer, "334 ").await?;
                    read_auth_line(reader).await?
                }
            };
            decode_plain(&payload)?
        }
        "LOGIN" => {
            let username_b64 = match initial {
                Some(b64) => b64.to_string(),
                None => {
                    write_reply(writer, &format!("334 {}", BASE64.encode("Username:"))).await?;
                    read_auth_line(reader).await?
                }
            };
            write_reply(writer, &format!("334 {}", BASE64.encode("Password:"))).await?;
            let password_b64 = read_auth_line(reader).await?;
            (decode_b64(&username_b64)?, decode_b64(&password_b64)?)
        }
        _ => return Err(SmtpError::new(504, "unsupported authentication mechanism")),
    };

    backend.login(remote, &username, &password).await
}

/// Read one base64 line of an AUTH dialogue; `*` cancels.
async fn read_auth_line<R>(reader: &mut BufReader<ReadHalf<R>>) -> Result<String, SmtpError>
where
    R: AsyncRead + AsyncWrite,
{
    let Some(line) = read_command_line(reader).await? else {
        return Err(SmtpError::fatal(421, "connection closed"));
    };
    if line.trim() == "*" {
        return Err(SmtpError::new(501, "authentication cancelled"));
    }
    Ok(line.trim().to_string())
}

fn decode_b64(value: &str) -> Result<String, SmtpError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|_| SmtpError::new(501, "invalid base64"))?;
    String::from_utf8(bytes).map_err(|_| SmtpError::new(501, "invalid encoding"))
}

/// PLAIN: base64("authzid NUL authcid NUL password").
fn decode_plain(payload: &str) -> Result<(String, String), SmtpError> {
    let decoded = decode_b64(payload)?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next().unwrap_or("");
    let authcid = parts
        .next()
        .ok_or_else(|| SmtpError::new(501, "invalid PLAIN response"))?;
    let password = parts
        .next()
        .ok_or_else(|| SmtpError::new(501, "invalid PLAIN response"))?;
    Ok((authcid.to_string(), password.to_string()))
}

/// Read one CRLF-terminated command line. None on clean EOF.
async fn read_command_line<R>(
    reader: &mut BufReader<ReadHalf<R>>,
) -> Result<Option<String>, SmtpError>
where
    R: AsyncRead + AsyncWrite,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > 4096 {
        return Err(SmtpError::fatal(500, "line too long"));
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).to_string()))
}

/// Read the DATA body up to the lone-dot terminator, unstuffing as we go.
/// Oversized messages are drained to the terminator, then refused.
async fn read_data<R>(
    reader: &mut BufReader<ReadHalf<R>>,
    max_bytes: usize,
) -> Result<Vec<u8>, SmtpError>
where
    R: AsyncRead + AsyncWrite,
{
    let mut out = Vec::new();
    let mut oversized = false;
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(SmtpError::fatal(421, "connection closed during DATA"));
        }
        if line == b".\r\n" || line == b".\n" {
            break;
        }
        let stripped = dot_stuffer::unstuff_line(&line);
        if out.len() + stripped.len() > max_bytes {
            oversized = true;
            continue;
        }
        out.extend_from_slice(stripped);
    }
    if oversized {
        return Err(SmtpError::new(552, "message exceeds maximum size"));
    }
    Ok(out)
}

fn split_verb(line: &str) -> (String, &str) {
    match line.find(' ') {
        Some(sp) => (line[..sp].to_ascii_uppercase(), line[sp + 1..].trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Extract the address from `FROM:<a@b> [params]` / `TO:<a@b>`.
fn parse_path(rest: &str, prefix: &str) -> Option<String> {
    let rest = rest.trim();
    if rest.len() < prefix.len() || !rest[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = rest[prefix.len()..].trim();
    let path = match rest.find(' ') {
        Some(sp) => &rest[..sp],
        None => rest,
    };
    let path = path.trim();
    let path = path.strip_prefix('<').unwrap_or(path);
    let path = path.strip_suffix('>').unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

async fn write_reply<W>(writer: &mut WriteHalf<W>, reply: &str) -> Result<(), SmtpError>
where
    W: AsyncRead + AsyncWrite,
{
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("FROM:<a@yggmail>", "FROM:").as_deref(),
            Some("a@yggmail")
        );
        assert_eq!(
            parse_path("from:<a@yggmail> SIZE=100", "FROM:").as_deref(),
            Some("a@yggmail")
        );
        assert_eq!(parse_path("TO:<b@yggmail>", "TO:").as_deref(), Some("b@yggmail"));
        assert_eq!(parse_path("TO:b@yggmail", "TO:").as_deref(), Some("b@yggmail"));
        assert_eq!(parse_path("FROM:<>", "FROM:"), None);
        assert_eq!(parse_path("NONSENSE", "FROM:"), None);
    }

    #[test]
    fn plain_decoding() {
        let payload = BASE64.encode("\0user\0secret");
        assert_eq!(
            decode_plain(&payload).unwrap(),
            ("user".to_string(), "secret".to_string())
        );
        assert!(decode_plain("!!!").is_err());
    }
}
