/*
 * client.rs
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

//! SMTP client used by the outbound drainer: greeting, EHLO, MAIL FROM,
//! RCPT TO, DATA, QUIT over an already-authenticated overlay stream. No
//! STARTTLS and no AUTH: the transport below is encrypted and the far
//! side accepts mail on peer identity alone.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::smtp::dot_stuffer;
use crate::smtp::SmtpError;

/// Parsed SMTP reply: code plus all lines of a multi-line response.
struct SmtpResponse {
    code: u16,
    lines: Vec<String>,
}

impl SmtpResponse {
    fn message(&self) -> &str {
        self.lines.last().map(|s| s.as_str()).unwrap_or("")
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// SMTP client over any reliable stream.
pub struct SmtpClient<S> {
    stream: S,
    read_buf: Vec<u8>,
}

impl<S> SmtpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take an open stream and consume the server's 220 greeting.
    pub async fn connect(stream: S) -> Result<Self, SmtpError> {
        let mut client = Self {
            stream,
            read_buf: Vec::with_capacity(1024),
        };
        let r = client.read_response().await?;
        if r.code != 220 {
            return Err(SmtpError::new(
                r.code,
                format!("expected 220 greeting, got {}", r.message()),
            ));
        }
        Ok(client)
    }

    /// EHLO with our own hex public key as the client name.
    pub async fn hello(&mut self, local_name: &str) -> Result<(), SmtpError> {
        self.write_line(format!("EHLO {}", local_name).as_bytes())
            .await?;
        let r = self.read_response().await?;
        if r.code == 502 || r.code == 500 {
            // fall back to the older greeting
            self.write_line(format!("HELO {}", local_name).as_bytes())
                .await?;
            let r = self.read_response().await?;
            if !r.is_success() {
                return Err(SmtpError::new(r.code, format!("HELO failed: {}", r.message())));
            }
            return Ok(());
        }
        if !r.is_success() {
            return Err(SmtpError::new(r.code, format!("EHLO failed: {}", r.message())));
        }
        Ok(())
    }

    pub async fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        self.write_line(format!("MAIL FROM:<{}>", from).as_bytes())
            .await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpError::new(
                r.code,
                format!("MAIL FROM failed: {}", r.message()),
            ));
        }
        Ok(())
    }

    pub async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        self.write_line(format!("RCPT TO:<{}>", to).as_bytes())
            .await?;
        let r = self.read_response().await?;
        if !r.is_success() && r.code != 251 {
            return Err(SmtpError::new(
                r.code,
                format!("RCPT TO failed: {}", r.message()),
            ));
        }
        Ok(())
    }

    /// Send the message body. The queue row may only be removed once this
    /// returns Ok: the 250 after the terminator is the peer accepting
    /// responsibility for the message.
    pub async fn data(&mut self, message: &[u8]) -> Result<(), SmtpError> {
        self.write_line(b"DATA").await?;
        let r = self.read_response().await?;
        if r.code != 354 {
            return Err(SmtpError::new(
                r.code,
                format!("DATA not accepted: {}", r.message()),
            ));
        }
        let stuffed = dot_stuffer::stuff(message);
        self.stream.write_all(&stuffed).await?;
        self.stream.flush().await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpError::new(
                r.code,
                format!("message rejected: {}", r.message()),
            ));
        }
        Ok(())
    }

    pub async fn quit(mut self) -> Result<(), SmtpError> {
        self.write_line(b"QUIT").await?;
        let _ = self.read_response().await;
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.stream.write_all(line).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one reply, single or multi-line.
    async fn read_response(&mut self) -> Result<SmtpResponse, SmtpError> {
        let buf = &mut self.read_buf;
        let mut lines = Vec::new();
        loop {
            buf.clear();
            while buf.len() < 2 || buf[buf.len() - 2..] != *b"\r\n" {
                let mut b = [0u8; 1];
                let n = self.stream.read(&mut b).await?;
                if n == 0 {
                    return Err(SmtpError::fatal(421, "connection closed"));
                }
                buf.push(b[0]);
                if buf.len() > 4096 {
                    return Err(SmtpError::fatal(500, "response line too long"));
                }
            }
            let line = String::from_utf8_lossy(&buf[..buf.len() - 2]).to_string();
            if line.len() < 4 {
                if line.len() == 3 {
                    let code: u16 = line.parse().unwrap_or(0);
                    lines.push(String::new());
                    return Ok(SmtpResponse { code, lines });
                }
                continue;
            }
            let code: u16 = line[..3].parse().unwrap_or(0);
            let continuation = line.as_bytes()[3] == b'-';
            lines.push(line[4..].trim().to_string());
            if !continuation {
                return Ok(SmtpResponse { code, lines });
            }
        }
    }
}
