//! RFC 5322 header extraction: folding, encoded-words and date parsing.
//!
//! This is the capability that turns raw header bytes into a [`MessageRef`].

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use tracing::debug;

use crate::model::message::MessageRef;

/// Build a [`MessageRef`] from raw message bytes (headers alone or a full
/// message; anything after the first blank line is ignored).
///
/// Never fails: missing fields come back empty and are rejected later, when
/// the local path is derived.
pub fn message_ref(folder: &str, raw: &[u8]) -> MessageRef {
    let header_bytes = &raw[..find_header_end(raw).unwrap_or(raw.len())];
    let text = decode_header_bytes(header_bytes);
    let headers = unfold_headers(&text);

    let raw_value = |name: &str| get_header(&headers, name).unwrap_or_default();

    MessageRef {
        folder: folder.to_string(),
        message_id: raw_value("message-id"),
        date: raw_value("date"),
        subject: decode_encoded_words(&raw_value("subject")),
        from: decode_encoded_words(&raw_value("from")),
        to: decode_encoded_words(&raw_value("to")),
    }
}

/// Byte offset where the header block ends (start of the blank line), if any.
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\n") || data.starts_with(b"\r\n") {
        return Some(0);
    }
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some(i + 1);
        }
        if i + 3 < data.len()
            && data[i] == b'\r'
            && data[i + 1] == b'\n'
            && data[i + 2] == b'\r'
            && data[i + 3] == b'\n'
        {
            return Some(i + 2);
        }
    }
    None
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, value)` pairs.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            result.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    result
}

/// Get the first value for a header name.
fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim().to_string())
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// The value is wrapped in a minimal message so `mail-parser` applies its
/// own decoder; on failure the input is returned unchanged.
pub fn decode_encoded_words(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }
    let fake_msg = format!("Subject: {input}\n\n");
    mail_parser::MessageParser::default()
        .parse(fake_msg.as_bytes())
        .and_then(|msg| msg.subject().map(str::to_string))
        .unwrap_or_else(|| input.to_string())
}

/// Parse an email date string, keeping the sender's UTC offset.
///
/// Supports RFC 2822, ISO 8601, and many broken real-world variants.
/// Dates without any zone information are taken as `+0000`.
pub fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = strip_trailing_comment(date_str.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt);
    }

    let no_dow = strip_day_of_week(trimmed);
    let no_dow_normalized = normalize_imap_date(&no_dow);

    let zoned_formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    let naive_formats = [
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
    ];

    for candidate in [&no_dow, &no_dow_normalized] {
        let replaced = replace_named_tz(candidate);
        for text in [candidate, &replaced] {
            for fmt in &zoned_formats {
                if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
                    return Some(dt);
                }
            }
        }
        for fmt in &naive_formats {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return FixedOffset::east_opt(0).map(|utc| utc.from_utc_datetime(&ndt));
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

/// Attempt to parse a date using `mail-parser`'s built-in parser.
fn mail_parser_date(input: &str) -> Option<DateTime<FixedOffset>> {
    let fake_msg = format!("Date: {input}\n\n");
    let parsed = mail_parser::MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt).ok()
}

/// Drop a trailing `(comment)` such as `"+0100 (CET)"`.
fn strip_trailing_comment(s: &str) -> &str {
    if s.ends_with(')') {
        if let Some(open) = s.rfind('(') {
            return s[..open].trim_end();
        }
    }
    s
}

/// Normalize IMAP-style dates: `"16-JUL-2025 03:01:03"` → `"16 Jul 2025 03:01:03"`.
fn normalize_imap_date(s: &str) -> String {
    if !s.contains('-') {
        return s.to_string();
    }

    let months = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    for month in &months {
        for variant in [month.to_uppercase(), month.to_lowercase(), month.to_string()] {
            let pattern = format!("-{variant}-");
            if s.contains(&pattern) {
                return s.replacen(&pattern, &format!(" {month} "), 1);
            }
        }
    }

    s.to_string()
}

/// Strip leading day-of-week prefix (e.g. "Thu, " or "Thu ").
fn strip_day_of_week(s: &str) -> String {
    let days = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in &days {
        if let Some(rest) = s.strip_prefix(day) {
            if rest.starts_with(',') || rest.starts_with(' ') {
                return rest.trim_start_matches(',').trim().to_string();
            }
        }
    }
    s.to_string()
}

/// Replace well-known timezone abbreviations with numeric offsets.
fn replace_named_tz(s: &str) -> String {
    let tzs = [
        ("CEST", "+0200"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("UT", "+0000"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    for (name, offset) in &tzs {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ref_from_headers() {
        let raw = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: =?UTF-8?B?SG9sYSBtdW5kbw==?=\r\n\
Message-ID:\r\n <abc@example.com>\r\n\
Date: Thu, 04 Jan 2024 10:00:00 +0100\r\n\
\r\n\
Body line\r\n";
        let r = message_ref("INBOX", raw);
        assert_eq!(r.folder, "INBOX");
        assert_eq!(r.message_id, "<abc@example.com>");
        assert_eq!(r.date, "Thu, 04 Jan 2024 10:00:00 +0100");
        assert_eq!(r.subject, "Hola mundo");
        assert_eq!(r.from, "Alice <alice@example.com>");
        assert_eq!(r.to, "bob@example.com");
    }

    #[test]
    fn test_message_ref_ignores_body_headers() {
        let raw = b"Subject: outer\n\nMessage-ID: <not-a-header@example.com>\n";
        let r = message_ref("INBOX", raw);
        assert_eq!(r.subject, "outer");
        assert!(r.message_id.is_empty());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"A: b\nC: d\n\nBody"), Some(10));
        assert_eq!(find_header_end(b"A: b\r\n\r\nBody"), Some(6));
        assert_eq!(find_header_end(b"\nBody"), Some(0));
        assert_eq!(find_header_end(b"A: b\n"), None);
    }

    #[test]
    fn test_unfold_headers() {
        let text = "Subject: This is a long\n\tsubject line\nFrom: user@example.com\n";
        let headers = unfold_headers(text);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "subject");
        assert_eq!(headers[0].1, "This is a long subject line");
    }

    #[test]
    fn test_decode_plain_passthrough() {
        assert_eq!(decode_encoded_words("Plain subject"), "Plain subject");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
    }

    #[test]
    fn test_parse_date_keeps_offset() {
        let dt = parse_date("Thu, 04 Jan 2024 23:30:00 -0500").unwrap();
        assert_eq!(dt.offset().local_minus_utc(), -5 * 3600);
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2024-01-04 23:30");
    }

    #[test]
    fn test_parse_date_with_comment() {
        let dt = parse_date("Mon, 3 Jun 2019 08:15:00 +0200 (CEST)").unwrap();
        assert_eq!(dt.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn test_parse_date_named_tz() {
        let dt = parse_date("Thu, 04 Jan 2024 10:00:00 EST").unwrap();
        assert_eq!(dt.offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_parse_date_iso8601() {
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());
    }

    #[test]
    fn test_parse_date_imap_style_is_utc() {
        let dt = parse_date("16-JUL-2025 03:01:03").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %z").to_string(), "2025-07-16 +0000");
    }

    #[test]
    fn test_parse_date_garbage() {
        assert!(parse_date("").is_none());
        assert!(parse_date("not a date at all").is_none());
    }

    #[test]
    fn test_normalize_imap_date() {
        assert_eq!(
            normalize_imap_date("10-MAR-2025 06:00:42"),
            "10 Mar 2025 06:00:42"
        );
        assert_eq!(
            normalize_imap_date("04 Jan 2024 10:00:00"),
            "04 Jan 2024 10:00:00"
        );
    }

    #[test]
    fn test_replace_named_tz() {
        assert_eq!(replace_named_tz("1 Jan 2024 10:00:00 CEST"), "1 Jan 2024 10:00:00 +0200");
        assert_eq!(replace_named_tz("1 Jan 2024 10:00:00 PDT"), "1 Jan 2024 10:00:00 -0700");
    }
}
