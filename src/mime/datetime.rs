/*
 * datetime.rs
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

//! RFC 5322 / IMAP date-time formatting and parsing.

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};

/// Format a timestamp as an RFC 2822 date-time, e.g.
/// "Fri, 21 Nov 1997 09:55:06 -0600". Used for Date, Received and
/// Delivery-Date headers added at delivery time.
pub fn format_rfc2822(when: DateTime<Local>) -> String {
    when.to_rfc2822()
}

/// Current time in RFC 2822 form.
pub fn now_rfc2822() -> String {
    format_rfc2822(Local::now())
}

/// Parse an RFC 5322 date-time. Returns None on failure.
pub fn parse_rfc5322_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value).ok()
}

/// Format a unix timestamp as an IMAP INTERNALDATE,
/// e.g. "17-Jul-1996 02:44:25 -0700".
pub fn format_internal_date(unix_seconds: i64) -> String {
    let when = Utc
        .timestamp_opt(unix_seconds, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());
    when.format("%d-%b-%Y %H:%M:%S +0000").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2822_round_trip() {
        let now = Local::now();
        let formatted = format_rfc2822(now);
        let parsed = parse_rfc5322_date(&formatted).expect("parse back");
        assert_eq!(parsed.timestamp(), now.timestamp());
    }

    #[test]
    fn internal_date_shape() {
        let s = format_internal_date(837571465);
        assert_eq!(s, "17-Jul-1996 02:44:25 +0000");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_rfc5322_date("not a date").is_none());
        assert!(parse_rfc5322_date("").is_none());
    }
}
