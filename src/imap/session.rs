/*
 * session.rs
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

//! One IMAP connection: read commands (literals included), dispatch them
//! against the store, write responses through the session's outbound pipe.
//! The pipe is shared with the notifier, so pushed EXISTS/STATUS lines
//! interleave between responses, never inside one.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::mpsc;

use crate::address;
use crate::imap::command::{parse_command, parse_sequence_set, Part, SeqItem, Token};
use crate::imap::fetch;
use crate::imap::notify::SessionShared;
use crate::imap::{ImapError, ImapServer};
use crate::storage::{StorageError, MAILBOX_INBOX, MAILBOX_OUTBOX, UID_VALIDITY};

/// Literal sizes are capped a little above the message size limit.
const MAX_LITERAL: usize = 32 * 1024 * 1024 + 4096;

pub async fn run<S>(server: Arc<ImapServer>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let shared = SessionShared::new(out_tx);
    server.notify.register(&shared);

    let mut session = Session {
        server,
        shared: shared.clone(),
        reader: BufReader::new(read_half),
        selected: None,
        read_only: false,
    };
    session.send_line("* OK [CAPABILITY IMAP4rev1 IDLE MOVE AUTH=PLAIN] Yggmail ready");
    if let Err(e) = session.run_loop().await {
        tracing::debug!("IMAP session ended: {}", e);
    }
    drop(session);
    drop(shared);
    let _ = writer.await;
}

struct Session<S> {
    server: Arc<ImapServer>,
    shared: Arc<SessionShared>,
    reader: BufReader<ReadHalf<S>>,
    selected: Option<String>,
    read_only: bool,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    async fn run_loop(&mut self) -> Result<(), ImapError> {
        loop {
            let Some(parts) = self.read_command_parts().await? else {
                return Ok(());
            };
            let command = match parse_command(&parts) {
                Ok(command) => command,
                Err(e) => {
                    self.send_line(&format!("* BAD {}", e));
                    continue;
                }
            };
            if self.dispatch(command).await? {
                return Ok(());
            }
        }
    }

    /// Handle one command; true means the session is over.
    async fn dispatch(&mut self, command: crate::imap::command::Command) -> Result<bool, ImapError> {
        let tag = command.tag.clone();
        let args = command.args;
        match command.name.as_str() {
            "CAPABILITY" => {
                self.send_line(&format!("* CAPABILITY {}", self.capabilities()));
                self.ok(&tag, "CAPABILITY completed");
            }
            "NOOP" => self.ok(&tag, "NOOP completed"),
            "LOGOUT" => {
                self.send_line("* BYE logging out");
                self.ok(&tag, "LOGOUT completed");
                return Ok(true);
            }
            "LOGIN" => self.cmd_login(&tag, &args).await,
            "AUTHENTICATE" => self.cmd_authenticate(&tag, &args).await?,
            _ if !self.authenticated() => {
                self.no(&tag, "please authenticate first");
            }
            "SELECT" => self.cmd_select(&tag, &args, false).await,
            "EXAMINE" => self.cmd_select(&tag, &args, true).await,
            "CREATE" => self.cmd_create(&tag, &args).await,
            "DELETE" => self.cmd_delete(&tag, &args).await,
            "RENAME" => self.cmd_rename(&tag, &args).await,
            "SUBSCRIBE" => self.cmd_subscribe(&tag, &args, true).await,
            "UNSUBSCRIBE" => self.cmd_subscribe(&tag, &args, false).await,
            "LIST" => self.cmd_list(&tag, &args, false).await,
            "LSUB" => self.cmd_list(&tag, &args, true).await,
            "STATUS" => self.cmd_status(&tag, &args).await,
            "APPEND" => self.cmd_append(&tag, &args).await,
            "UID" => return self.cmd_uid(&tag, &args).await,
            _ if self.selected.is_none() => {
                self.no(&tag, "no mailbox selected");
            }
            "CHECK" => self.ok(&tag, "CHECK completed"),
            "CLOSE" => self.cmd_close(&tag).await,
            "EXPUNGE" => self.cmd_expunge(&tag).await,
            "SEARCH" => self.cmd_search(&tag, false).await,
            "FETCH" => self.cmd_fetch(&tag, &args, false).await,
            "STORE" => self.cmd_store(&tag, &args, false).await,
            "COPY" => self.cmd_copy(&tag, &args, false, false).await,
            "MOVE" => self.cmd_copy(&tag, &args, false, true).await,
            "IDLE" => self.cmd_idle(&tag).await?,
            _ => self.bad(&tag, "unknown command"),
        }
        Ok(false)
    }

    async fn cmd_uid(&mut self, tag: &str, args: &[Token]) -> Result<bool, ImapError> {
        if self.selected.is_none() {
            self.no(tag, "no mailbox selected");
            return Ok(false);
        }
        let sub = args
            .first()
            .and_then(|t| t.as_text())
            .unwrap_or_default()
            .to_ascii_uppercase();
        let rest = &args[1.min(args.len())..];
        match sub.as_str() {
            "FETCH" => self.cmd_fetch(tag, rest, true).await,
            "STORE" => self.cmd_store(tag, rest, true).await,
            "COPY" => self.cmd_copy(tag, rest, true, false).await,
            "MOVE" => self.cmd_copy(tag, rest, true, true).await,
            "SEARCH" => self.cmd_search(tag, true).await,
            _ => self.bad(tag, "unknown UID command"),
        }
        Ok(false)
    }

    // --- authentication ---

    async fn cmd_login(&mut self, tag: &str, args: &[Token]) {
        let (Some(username), Some(password)) = (
            args.first().and_then(|t| t.as_text()),
            args.get(1).and_then(|t| t.as_text()),
        ) else {
            self.bad(tag, "LOGIN expects username and password");
            return;
        };
        if self.try_credentials(&username, &password).await {
            self.ok(tag, "LOGIN completed");
        } else {
            self.no(tag, "invalid credentials");
        }
    }

    async fn cmd_authenticate(&mut self, tag: &str, args: &[Token]) -> Result<(), ImapError> {
        let mechanism = args
            .first()
            .and_then(|t| t.as_text())
            .unwrap_or_default()
            .to_ascii_uppercase();
        if mechanism != "PLAIN" {
            self.no(tag, "unsupported authentication mechanism");
            return Ok(());
        }
        let payload = match args.get(1).and_then(|t| t.as_text()) {
            Some(initial) => initial,
            None => {
                self.send_line("+ ");
                match self.read_raw_line().await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            }
        };
        let Ok(decoded) = BASE64.decode(payload.trim()) else {
            self.no(tag, "invalid base64");
            return Ok(());
        };
        let decoded = String::from_utf8_lossy(&decoded).to_string();
        let mut parts = decoded.split('\0');
        let _authzid = parts.next();
        let (Some(username), Some(password)) = (parts.next(), parts.next()) else {
            self.no(tag, "invalid PLAIN response");
            return Ok(());
        };
        if self.try_credentials(username, password).await {
            self.ok(tag, "AUTHENTICATE completed");
        } else {
            self.no(tag, "invalid credentials");
        }
        Ok(())
    }

    async fn try_credentials(&mut self, username: &str, password: &str) -> bool {
        if username.contains('@') {
            match address::parse_address(username) {
                Ok(key) if key == self.server.config.public_key_bytes() => {}
                _ => {
                    tracing::info!("failed IMAP authentication for {:?}", username);
                    return false;
                }
            }
        }
        match self.server.storage.config_try_password(password).await {
            Ok(true) => {
                tracing::info!("authenticated IMAP user {:?}", username);
                self.shared.authenticated.store(true, Ordering::Release);
                true
            }
            Ok(false) => {
                tracing::info!("failed IMAP authentication for {:?}", username);
                false
            }
            Err(e) => {
                tracing::warn!("IMAP authentication error: {}", e);
                false
            }
        }
    }

    // --- mailbox management ---

    async fn cmd_select(&mut self, tag: &str, args: &[Token], examine: bool) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "SELECT expects a mailbox");
            return;
        };
        match self.server.storage.mailbox_select(&name).await {
            Ok(true) => {}
            Ok(false) => {
                self.no(tag, "no such mailbox");
                return;
            }
            Err(e) => {
                self.storage_no(tag, e);
                return;
            }
        }
        let (count, next) = match (
            self.server.storage.mail_count(&name).await,
            self.server.storage.mail_next_id(&name).await,
        ) {
            (Ok(count), Ok(next)) => (count, next),
            (Err(e), _) | (_, Err(e)) => {
                self.storage_no(tag, e);
                return;
            }
        };
        self.send_line("* FLAGS (\\Seen \\Answered \\Flagged \\Deleted)");
        self.send_line(&format!("* {} EXISTS", count));
        self.send_line("* 0 RECENT");
        self.send_line(
            "* OK [PERMANENTFLAGS (\\Seen \\Answered \\Flagged \\Deleted)] flags allowed",
        );
        self.send_line(&format!("* OK [UIDNEXT {}] next UID", next));
        self.send_line(&format!("* OK [UIDVALIDITY {}] UIDs valid", UID_VALIDITY));
        self.selected = Some(name.clone());
        self.read_only = examine;
        *self.shared.selected.lock().unwrap() = Some(name);
        if examine {
            self.ok(tag, "[READ-ONLY] EXAMINE completed");
        } else {
            self.ok(tag, "[READ-WRITE] SELECT completed");
        }
    }

    async fn cmd_create(&mut self, tag: &str, args: &[Token]) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "CREATE expects a mailbox");
            return;
        };
        match self.server.storage.mailbox_create(&name).await {
            Ok(()) => self.ok(tag, "CREATE completed"),
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_delete(&mut self, tag: &str, args: &[Token]) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "DELETE expects a mailbox");
            return;
        };
        match self.server.storage.mailbox_delete(&name).await {
            Ok(()) => self.ok(tag, "DELETE completed"),
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_rename(&mut self, tag: &str, args: &[Token]) {
        let (Some(old), Some(new)) = (mailbox_arg(args.first()), mailbox_arg(args.get(1))) else {
            self.bad(tag, "RENAME expects two mailboxes");
            return;
        };
        match self.server.storage.mailbox_rename(&old, &new).await {
            Ok(()) => self.ok(tag, "RENAME completed"),
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_subscribe(&mut self, tag: &str, args: &[Token], subscribed: bool) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "expects a mailbox");
            return;
        };
        match self
            .server
            .storage
            .mailbox_subscribe(&name, subscribed)
            .await
        {
            Ok(()) => self.ok(tag, "completed"),
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_list(&mut self, tag: &str, args: &[Token], subscribed_only: bool) {
        let verb = if subscribed_only { "LSUB" } else { "LIST" };
        let pattern = args.get(1).and_then(|t| t.as_text()).unwrap_or_default();
        if pattern.is_empty() {
            self.send_line(&format!("* {} (\\Noselect) \"/\" \"\"", verb));
            self.ok(tag, "completed");
            return;
        }
        match self.server.storage.mailbox_list(subscribed_only).await {
            Ok(names) => {
                for name in names {
                    if wildcard_match(&pattern, &name) {
                        self.send_line(&format!("* {} () \"/\" \"{}\"", verb, name));
                    }
                }
                self.ok(tag, "completed");
            }
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_status(&mut self, tag: &str, args: &[Token]) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "STATUS expects a mailbox");
            return;
        };
        match self.server.storage.mailbox_select(&name).await {
            Ok(true) => {}
            Ok(false) => {
                self.no(tag, "no such mailbox");
                return;
            }
            Err(e) => {
                self.storage_no(tag, e);
                return;
            }
        }
        let items: Vec<String> = args
            .iter()
            .skip(1)
            .filter_map(|t| match t {
                Token::Atom(a) => Some(a.to_ascii_uppercase()),
                _ => None,
            })
            .collect();
        let mut rendered = Vec::new();
        for item in &items {
            let value = match item.as_str() {
                "MESSAGES" => self.server.storage.mail_count(&name).await.ok(),
                "UIDNEXT" => self.server.storage.mail_next_id(&name).await.ok(),
                "UIDVALIDITY" => Some(UID_VALIDITY),
                "UNSEEN" => self.server.storage.mail_unseen(&name).await.ok(),
                "RECENT" => Some(0),
                _ => None,
            };
            if let Some(value) = value {
                rendered.push(format!("{} {}", item, value));
            }
        }
        self.send_line(&format!("* STATUS \"{}\" ({})", name, rendered.join(" ")));
        self.ok(tag, "STATUS completed");
    }

    async fn cmd_append(&mut self, tag: &str, args: &[Token]) {
        let Some(name) = mailbox_arg(args.first()) else {
            self.bad(tag, "APPEND expects a mailbox");
            return;
        };
        if name == MAILBOX_OUTBOX {
            self.no(tag, "cannot append into Outbox");
            return;
        }
        let Some(Token::Bytes(content)) = args.last() else {
            self.bad(tag, "APPEND expects a message literal");
            return;
        };
        let flags = paren_atoms(args);
        match self.server.storage.mail_create(&name, content.clone()).await {
            Ok(uid) => {
                if !flags.is_empty() {
                    let (seen, answered, flagged, deleted) = flags_from_atoms(&flags);
                    if let Err(e) = self
                        .server
                        .storage
                        .mail_update_flags(&name, uid, seen, answered, flagged, deleted)
                        .await
                    {
                        self.storage_no(tag, e);
                        return;
                    }
                }
                self.ok(tag, &format!("[APPENDUID {} {}] APPEND completed", UID_VALIDITY, uid));
            }
            Err(e) => self.storage_no(tag, e),
        }
    }

    // --- selected state ---

    async fn cmd_close(&mut self, tag: &str) {
        if let Some(mailbox) = self.selected.clone() {
            if !self.read_only {
                if let Err(e) = self.server.storage.mail_expunge(&mailbox).await {
                    self.storage_no(tag, e);
                    return;
                }
            }
        }
        self.selected = None;
        *self.shared.selected.lock().unwrap() = None;
        self.ok(tag, "CLOSE completed");
    }

    async fn cmd_expunge(&mut self, tag: &str) {
        let mailbox = self.selected.clone().unwrap_or_default();
        let uids = match self.server.storage.mail_search(&mailbox).await {
            Ok(uids) => uids,
            Err(e) => {
                self.storage_no(tag, e);
                return;
            }
        };
        let mut doomed: Vec<u32> = Vec::new();
        for uid in uids {
            if let Ok((seq, mail)) = self.server.storage.mail_select(&mailbox, uid).await {
                if mail.deleted {
                    doomed.push(seq);
                }
            }
        }
        if let Err(e) = self.server.storage.mail_expunge(&mailbox).await {
            self.storage_no(tag, e);
            return;
        }
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for seq in doomed {
            self.send_line(&format!("* {} EXPUNGE", seq));
        }
        self.ok(tag, "EXPUNGE completed");
    }

    async fn cmd_search(&mut self, tag: &str, uid_mode: bool) {
        let mailbox = self.selected.clone().unwrap_or_default();
        match self.server.storage.mail_search(&mailbox).await {
            Ok(uids) => {
                let listed: Vec<String> = if uid_mode {
                    uids.iter().map(|u| u.to_string()).collect()
                } else {
                    (1..=uids.len()).map(|s| s.to_string()).collect()
                };
                if listed.is_empty() {
                    self.send_line("* SEARCH");
                } else {
                    self.send_line(&format!("* SEARCH {}", listed.join(" ")));
                }
                self.ok(tag, "SEARCH completed");
            }
            Err(e) => self.storage_no(tag, e),
        }
    }

    async fn cmd_fetch(&mut self, tag: &str, args: &[Token], uid_mode: bool) {
        let mailbox = self.selected.clone().unwrap_or_default();
        let Some(set_text) = args.first().and_then(|t| t.as_text()) else {
            self.bad(tag, "FETCH expects a sequence set");
            return;
        };
        let item_atoms = item_atoms(&args[1..]);
        let items = fetch::parse_items(&item_atoms);
        if items.is_empty() {
            self.bad(tag, "FETCH expects items");
            return;
        }
        let uids = match self.resolve_set(&mailbox, uid_mode, &set_text).await {
            Ok(uids) => uids,
            Err(e) => {
                self.no(tag, &e);
                return;
            }
        };
        let mark_seen = fetch::wants_mark_seen(&items) && !self.read_only;
        for uid in uids {
            let Ok((seq, mail)) = self.server.storage.mail_select(&mailbox, uid).await else {
                continue;
            };
            self.send_bytes(fetch::render_fetch(seq, &mail, &items, uid_mode));
            if mark_seen && !mail.seen {
                let _ = self
                    .server
                    .storage
                    .mail_update_flags(&mailbox, uid, true, mail.answered, mail.flagged, mail.deleted)
                    .await;
            }
        }
        self.ok(tag, "FETCH completed");
    }

    async fn cmd_store(&mut self, tag: &str, args: &[Token], uid_mode: bool) {
        let mailbox = self.selected.clone().unwrap_or_default();
        let (Some(set_text), Some(op)) = (
            args.first().and_then(|t| t.as_text()),
            args.get(1).and_then(|t| t.as_text()),
        ) else {
            self.bad(tag, "STORE expects a sequence set and an operation");
            return;
        };
        let op = op.to_ascii_uppercase();
        let silent = op.ends_with(".SILENT");
        let op = op.trim_end_matches(".SILENT");
        let flags = paren_atoms(&args[2..]);
        let (seen, answered, flagged, deleted) = flags_from_atoms(&flags);

        let uids = match self.resolve_set(&mailbox, uid_mode, &set_text).await {
            Ok(uids) => uids,
            Err(e) => {
                self.no(tag, &e);
                return;
            }
        };
        for uid in uids {
            let Ok((_, mail)) = self.server.storage.mail_select(&mailbox, uid).await else {
                continue;
            };
            let new_flags = match op {
                "FLAGS" => (seen, answered, flagged, deleted),
                "+FLAGS" => (
                    mail.seen || seen,
                    mail.answered || answered,
                    mail.flagged || flagged,
                    mail.deleted || deleted,
                ),
                "-FLAGS" => (
                    mail.seen && !seen,
                    mail.answered && !answered,
                    mail.flagged && !flagged,
                    mail.deleted && !deleted,
                ),
                _ => {
                    self.bad(tag, "unknown STORE operation");
                    return;
                }
            };
            if let Err(e) = self
                .server
                .storage
                .mail_update_flags(&mailbox, uid, new_flags.0, new_flags.1, new_flags.2, new_flags.3)
                .await
            {
                self.storage_no(tag, e);
                return;
            }
            if !silent {
                if let Ok((seq_after, updated)) =
                    self.server.storage.mail_select(&mailbox, uid).await
                {
                    let uid_part = if uid_mode {
                        format!(" UID {}", uid)
                    } else {
                        String::new()
                    };
                    self.send_line(&format!(
                        "* {} FETCH (FLAGS {}{})",
                        seq_after,
                        fetch::render_flags(&updated),
                        uid_part
                    ));
                }
            }
        }
        self.ok(tag, "STORE completed");
    }

    async fn cmd_copy(&mut self, tag: &str, args: &[Token], uid_mode: bool, mv: bool) {
        let mailbox = self.selected.clone().unwrap_or_default();
        let (Some(set_text), Some(dest)) = (
            args.first().and_then(|t| t.as_text()),
            mailbox_arg(args.get(1)),
        ) else {
            self.bad(tag, "expects a sequence set and a mailbox");
            return;
        };
        if dest == MAILBOX_OUTBOX {
            self.no(tag, "Outbox is a protected folder");
            return;
        }
        match self.server.storage.mailbox_select(&dest).await {
            Ok(true) => {}
            Ok(false) => {
                self.no(tag, "[TRYCREATE] no such mailbox");
                return;
            }
            Err(e) => {
                self.storage_no(tag, e);
                return;
            }
        }
        let uids = match self.resolve_set(&mailbox, uid_mode, &set_text).await {
            Ok(uids) => uids,
            Err(e) => {
                self.no(tag, &e);
                return;
            }
        };
        let mut expunged: Vec<u32> = Vec::new();
        for uid in uids {
            let Ok((seq, mail)) = self.server.storage.mail_select(&mailbox, uid).await else {
                continue;
            };
            if mv {
                match self.server.storage.mail_move(&mailbox, uid, &dest).await {
                    Ok(_) => expunged.push(seq),
                    Err(e) => {
                        self.storage_no(tag, e);
                        return;
                    }
                }
            } else {
                let created = match self.server.storage.mail_create(&dest, mail.mail.clone()).await
                {
                    Ok(created) => created,
                    Err(e) => {
                        self.storage_no(tag, e);
                        return;
                    }
                };
                let (seen, answered, flagged, deleted) = mail.flags();
                if let Err(e) = self
                    .server
                    .storage
                    .mail_update_flags(&dest, created, seen, answered, flagged, deleted)
                    .await
                {
                    self.storage_no(tag, e);
                    return;
                }
            }
        }
        expunged.sort_unstable_by(|a, b| b.cmp(a));
        for seq in expunged {
            self.send_line(&format!("* {} EXPUNGE", seq));
        }
        self.ok(tag, if mv { "MOVE completed" } else { "COPY completed" });
    }

    async fn cmd_idle(&mut self, tag: &str) -> Result<(), ImapError> {
        self.send_line("+ idling");
        loop {
            let Some(line) = self.read_raw_line().await? else {
                return Ok(());
            };
            if line.trim().eq_ignore_ascii_case("DONE") {
                self.ok(tag, "IDLE terminated");
                return Ok(());
            }
        }
    }

    // --- plumbing ---

    /// Resolve a sequence set to UIDs. `*`/0 means the highest UID; in
    /// sequence-number mode each ordinal is translated through the store.
    async fn resolve_set(
        &self,
        mailbox: &str,
        uid_mode: bool,
        set_text: &str,
    ) -> Result<Vec<u32>, String> {
        let Some(set) = parse_sequence_set(set_text) else {
            return Err("bad sequence set".to_string());
        };
        let next = self
            .server
            .storage
            .mail_next_id(mailbox)
            .await
            .map_err(|e| e.to_string())?;
        let last = next.saturating_sub(1);
        let mut out = Vec::new();
        for item in set {
            let (a, b) = match item {
                SeqItem::Single(n) => (n, n),
                SeqItem::Range(a, b) => (a, b),
            };
            let a = if a == 0 { last } else { a };
            let b = if b == 0 { last } else { b };
            let (a, b) = if a <= b { (a, b) } else { (b, a) };
            let b = b.min(last);
            for n in a..=b {
                if n == 0 {
                    continue;
                }
                if uid_mode {
                    out.push(n);
                } else {
                    match self.server.storage.mail_id_for_seq(mailbox, n).await {
                        Ok(uid) => out.push(uid),
                        Err(StorageError::NotFound) => {}
                        Err(e) => return Err(e.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read one command's parts, answering literal continuations inline.
    async fn read_command_parts(&mut self) -> Result<Option<Vec<Part>>, ImapError> {
        let mut parts = Vec::new();
        loop {
            let Some(line) = self.read_raw_line().await? else {
                return Ok(None);
            };
            match literal_marker(&line) {
                Some((size, _)) if size > MAX_LITERAL => {
                    return Err(ImapError::new("literal too large"));
                }
                Some((size, sync)) => {
                    parts.push(Part::Line(line));
                    if sync {
                        self.send_line("+ OK");
                    }
                    let mut bytes = vec![0u8; size];
                    self.reader
                        .read_exact(&mut bytes)
                        .await
                        .map_err(|e| ImapError::new(e.to_string()))?;
                    parts.push(Part::Literal(bytes));
                }
                None => {
                    parts.push(Part::Line(line));
                    return Ok(Some(parts));
                }
            }
        }
    }

    async fn read_raw_line(&mut self) -> Result<Option<String>, ImapError> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ImapError::new(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).to_string()))
    }

    fn authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    fn capabilities(&self) -> String {
        let mut caps = "IMAP4rev1 IDLE MOVE".to_string();
        if self.authenticated() {
            caps.push_str(" NOTIFY");
        } else {
            caps.push_str(" AUTH=PLAIN");
        }
        caps
    }

    fn send_bytes(&self, bytes: Vec<u8>) {
        let _ = self.shared.out_tx.send(bytes);
    }

    fn send_line(&self, line: &str) {
        self.shared.send_line(line.to_string());
    }

    fn ok(&self, tag: &str, msg: &str) {
        self.send_line(&format!("{} OK {}", tag, msg));
    }

    fn no(&self, tag: &str, msg: &str) {
        self.send_line(&format!("{} NO {}", tag, msg));
    }

    fn bad(&self, tag: &str, msg: &str) {
        self.send_line(&format!("{} BAD {}", tag, msg));
    }

    fn storage_no(&self, tag: &str, e: StorageError) {
        match e {
            StorageError::Protected(name) => {
                self.no(tag, &format!("{} is a protected mailbox", name))
            }
            StorageError::NotFound => self.no(tag, "not found"),
            StorageError::Message(m) => {
                tracing::warn!("storage error: {}", m);
                self.no(tag, "server error");
            }
        }
    }
}

/// Mailbox argument, with the mandated case-insensitive INBOX spelling.
fn mailbox_arg(token: Option<&Token>) -> Option<String> {
    let name = token.and_then(|t| t.as_text())?;
    if name.eq_ignore_ascii_case(MAILBOX_INBOX) {
        return Some(MAILBOX_INBOX.to_string());
    }
    Some(name)
}

/// `{n}` / `{n+}` at the end of a command line.
fn literal_marker(line: &str) -> Option<(usize, bool)> {
    if !line.ends_with('}') {
        return None;
    }
    let open = line.rfind('{')?;
    let inner = &line[open + 1..line.len() - 1];
    let (digits, sync) = match inner.strip_suffix('+') {
        Some(digits) => (digits, false),
        None => (inner, true),
    };
    let size: usize = digits.parse().ok()?;
    Some((size, sync))
}

/// Atoms inside the first parenthesized group, e.g. STORE/APPEND flags.
fn paren_atoms(args: &[Token]) -> Vec<String> {
    let mut inside = false;
    let mut out = Vec::new();
    for token in args {
        match token {
            Token::LParen => inside = true,
            Token::RParen if inside => break,
            Token::Atom(a) if inside => out.push(a.clone()),
            _ => {}
        }
    }
    out
}

/// FETCH item atoms: a parenthesized list or a single item.
fn item_atoms(args: &[Token]) -> Vec<String> {
    let mut out = Vec::new();
    for token in args {
        match token {
            Token::Atom(a) => out.push(a.clone()),
            _ => {}
        }
    }
    out
}

fn flags_from_atoms(atoms: &[String]) -> (bool, bool, bool, bool) {
    let (mut seen, mut answered, mut flagged, mut deleted) = (false, false, false, false);
    for atom in atoms {
        match atom.to_ascii_lowercase().as_str() {
            "\\seen" => seen = true,
            "\\answered" => answered = true,
            "\\flagged" => flagged = true,
            "\\deleted" => deleted = true,
            _ => {}
        }
    }
    (seen, answered, flagged, deleted)
}

/// `*` and `%` both match any run of characters; the namespace is flat.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*') | Some(b'%'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b) && matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match("*", "INBOX"));
        assert!(wildcard_match("%", "INBOX"));
        assert!(wildcard_match("IN*", "INBOX"));
        assert!(wildcard_match("inbox", "INBOX"));
        assert!(!wildcard_match("Sent", "INBOX"));
    }

    #[test]
    fn literal_markers() {
        assert_eq!(literal_marker("a APPEND INBOX {310}"), Some((310, true)));
        assert_eq!(literal_marker("a APPEND INBOX {310+}"), Some((310, false)));
        assert_eq!(literal_marker("a NOOP"), None);
    }

    #[test]
    fn flag_atom_parsing() {
        let flags = vec!["\\Seen".to_string(), "\\Deleted".to_string()];
        assert_eq!(flags_from_atoms(&flags), (true, false, false, true));
    }
}
