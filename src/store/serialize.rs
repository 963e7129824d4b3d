//! Strict serialization of a [`MessageBody`] back to bytes, and the repairs
//! for the two failures that can be fixed mechanically.
//!
//! Serialization never fails halfway through a file: it builds the whole
//! message in memory and reports an outcome.

use crate::model::body::{content_type_params, MessageBody, Payload};
use crate::parser::mime::delimiter_kind;

/// Path of a part inside the MIME tree (child indexes from the root).
pub type PartPath = Vec<usize>;

/// A serialization failure the writer knows how to repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairReason {
    /// A sub-part carries 8-bit data but declares no transfer encoding.
    MissingTransferEncoding { part: PartPath },
    /// A part's body is not valid in the charset it declares.
    UnencodableCharset { part: PartPath, charset: String },
}

impl std::fmt::Display for RepairReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTransferEncoding { part } => {
                write!(f, "part {part:?} has 8-bit data and no Content-Transfer-Encoding")
            }
            Self::UnencodableCharset { part, charset } => {
                write!(f, "part {part:?} is not valid {charset}")
            }
        }
    }
}

/// Outcome of one serialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Serialized {
    Ok(Vec<u8>),
    Recoverable(RepairReason),
    Fatal(String),
}

enum Failure {
    Recoverable(RepairReason),
    Fatal(String),
}

/// Serialize a message tree.
pub fn serialize(message: &MessageBody) -> Serialized {
    let mut out = Vec::new();
    let mut boundaries = Vec::new();
    let mut path = Vec::new();
    match write_entity(message, &mut out, &mut boundaries, &mut path) {
        Ok(()) => Serialized::Ok(out),
        Err(Failure::Recoverable(reason)) => Serialized::Recoverable(reason),
        Err(Failure::Fatal(reason)) => Serialized::Fatal(reason),
    }
}

fn write_entity<'a>(
    entity: &'a MessageBody,
    out: &mut Vec<u8>,
    boundaries: &mut Vec<&'a str>,
    path: &mut PartPath,
) -> Result<(), Failure> {
    let eol = entity.line_ending.as_bytes();

    for field in &entity.headers {
        if !is_valid_field_name(&field.name) {
            return Err(Failure::Fatal(format!(
                "malformed header line '{}' in part {path:?}",
                field.name
            )));
        }
        let Some(value) = &field.value else {
            return Err(Failure::Fatal(format!(
                "header line without colon '{}' in part {path:?}",
                field.name
            )));
        };
        out.extend_from_slice(field.name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value);
        out.extend_from_slice(eol);
    }
    out.extend_from_slice(eol);

    match &entity.payload {
        Payload::Single(bytes) => {
            check_leaf(entity, bytes, boundaries, path)?;
            out.extend_from_slice(bytes);
        }
        Payload::Multipart(mp) => {
            let delimiter = format!("--{}", mp.boundary);
            if let Some(preamble) = &mp.preamble {
                out.extend_from_slice(preamble);
                out.extend_from_slice(eol);
            }
            boundaries.push(&mp.boundary);
            let last = mp.parts.len().saturating_sub(1);
            for (i, part) in mp.parts.iter().enumerate() {
                out.extend_from_slice(delimiter.as_bytes());
                out.extend_from_slice(eol);
                path.push(i);
                write_entity(part, out, boundaries, path)?;
                path.pop();
                if i < last || mp.closed {
                    out.extend_from_slice(eol);
                }
            }
            boundaries.pop();
            if mp.closed {
                out.extend_from_slice(delimiter.as_bytes());
                out.extend_from_slice(b"--");
                out.extend_from_slice(&mp.epilogue);
            }
        }
    }

    Ok(())
}

fn check_leaf(
    entity: &MessageBody,
    bytes: &[u8],
    boundaries: &[&str],
    path: &PartPath,
) -> Result<(), Failure> {
    for boundary in boundaries {
        if bytes
            .split(|&b| b == b'\n')
            .any(|line| delimiter_kind(line, boundary).is_some())
        {
            return Err(Failure::Fatal(format!(
                "part {path:?} contains the delimiter of boundary '{boundary}'"
            )));
        }
    }

    let cte = entity.header("content-transfer-encoding");
    let is_sub_part = !path.is_empty();
    if is_sub_part && cte.is_none() && !bytes.is_ascii() {
        return Err(Failure::Recoverable(RepairReason::MissingTransferEncoding {
            part: path.clone(),
        }));
    }

    if let Some(charset) = unfit_charset(entity, bytes) {
        return Err(Failure::Recoverable(RepairReason::UnencodableCharset {
            part: path.clone(),
            charset,
        }));
    }

    Ok(())
}

/// The declared charset of a leaf with an identity transfer encoding, if
/// its body bytes are not valid in it.
fn unfit_charset(entity: &MessageBody, bytes: &[u8]) -> Option<String> {
    let identity = entity
        .header("content-transfer-encoding")
        .map_or(true, |c| {
            matches!(
                c.to_ascii_lowercase().as_str(),
                "" | "7bit" | "8bit" | "binary"
            )
        });
    if !identity {
        return None;
    }
    entity
        .content_type_param("charset")
        .filter(|charset| !fits_charset(charset, bytes))
}

/// RFC 5322 field name: printable US-ASCII except colon.
fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

/// `true` if `bytes` is valid text in the named charset. Unknown charsets
/// cannot be checked and are accepted.
fn fits_charset(charset: &str, bytes: &[u8]) -> bool {
    let label = charset.trim().to_ascii_lowercase();
    if matches!(label.as_str(), "us-ascii" | "ascii" | "us_ascii") {
        return bytes.is_ascii();
    }
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .is_some(),
        None => true,
    }
}

/// Apply the single repair matching `reason`.
///
/// Returns the number of parts changed.
pub fn repair(message: &mut MessageBody, reason: &RepairReason) -> usize {
    match reason {
        RepairReason::MissingTransferEncoding { .. } => add_missing_transfer_encoding(message, 0),
        RepairReason::UnencodableCharset { .. } => strip_unfit_charsets(message),
    }
}

/// Drop the `charset` parameter of every leaf whose body does not fit it,
/// depth-first.
fn strip_unfit_charsets(entity: &mut MessageBody) -> usize {
    if let Payload::Multipart(mp) = &mut entity.payload {
        return mp.parts.iter_mut().map(strip_unfit_charsets).sum();
    }
    let unfit = match &entity.payload {
        Payload::Single(bytes) => unfit_charset(entity, bytes).is_some(),
        Payload::Multipart(_) => false,
    };
    match entity.header("content-type") {
        Some(ct) if unfit => {
            entity.set_header("Content-Type", &format!(" {}", strip_charset(&ct)));
            1
        }
        _ => 0,
    }
}

/// Give every leaf sub-part without a transfer encoding an explicit empty
/// one, depth-first.
fn add_missing_transfer_encoding(entity: &mut MessageBody, depth: usize) -> usize {
    match &mut entity.payload {
        Payload::Multipart(mp) => mp
            .parts
            .iter_mut()
            .map(|part| add_missing_transfer_encoding(part, depth + 1))
            .sum(),
        Payload::Single(_) => {
            if depth > 0 && !entity.has_header("content-transfer-encoding") {
                entity.set_header("Content-Transfer-Encoding", "");
                1
            } else {
                0
            }
        }
    }
}

/// Remove the `charset` parameter from a `Content-Type` value.
fn strip_charset(content_type: &str) -> String {
    let mime_type = content_type.split(';').next().unwrap_or_default().trim();
    let mut result = mime_type.to_string();
    for (key, value) in content_type_params(content_type) {
        if key.eq_ignore_ascii_case("charset") {
            continue;
        }
        result.push_str(&format!("; {key}=\"{value}\""));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::mime::parse_message;

    fn ok_bytes(outcome: Serialized) -> Vec<u8> {
        match outcome {
            Serialized::Ok(bytes) => bytes,
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let raw: &[u8] = b"Subject: Hi\r\nX-Folded: a\r\n\tb\r\n\r\nBody\r\n";
        assert_eq!(ok_bytes(serialize(&parse_message(raw))), raw);

        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
preamble\n\
--b\n\
Content-Type: text/plain\n\
\n\
one\n\
--b\n\
Content-Type: text/plain\n\
Content-Transfer-Encoding: 8bit\n\
\n\
caf\xc3\xa9\n\
--b--\n";
        assert_eq!(ok_bytes(serialize(&parse_message(raw))), raw);
    }

    #[test]
    fn test_missing_transfer_encoding_detected() {
        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
caf\xc3\xa9\n\
--b--\n";
        let msg = parse_message(raw);
        assert_eq!(
            serialize(&msg),
            Serialized::Recoverable(RepairReason::MissingTransferEncoding { part: vec![0] })
        );
    }

    #[test]
    fn test_top_level_8bit_without_cte_is_fine() {
        let raw: &[u8] = b"Content-Type: text/plain; charset=utf-8\n\ncaf\xc3\xa9\n";
        assert!(matches!(serialize(&parse_message(raw)), Serialized::Ok(_)));
    }

    #[test]
    fn test_repair_missing_transfer_encoding() {
        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain\n\
\n\
ascii only\n\
--b\n\
Content-Type: text/plain\n\
\n\
caf\xc3\xa9\n\
--b--\n";
        let mut msg = parse_message(raw);
        let Serialized::Recoverable(reason) = serialize(&msg) else {
            panic!("expected recoverable failure");
        };
        assert_eq!(repair(&mut msg, &reason), 2);
        let bytes = ok_bytes(serialize(&msg));
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("Content-Transfer-Encoding:\n").count(), 2);
    }

    #[test]
    fn test_unencodable_charset_detected_and_repaired() {
        let raw: &[u8] = b"Content-Type: text/plain; charset=\"us-ascii\"; format=flowed\n\
\n\
na\xc3\xafve\n";
        let mut msg = parse_message(raw);
        let outcome = serialize(&msg);
        let Serialized::Recoverable(reason) = outcome else {
            panic!("expected recoverable failure, got {outcome:?}");
        };
        assert_eq!(
            reason,
            RepairReason::UnencodableCharset {
                part: vec![],
                charset: "us-ascii".into()
            }
        );
        assert_eq!(repair(&mut msg, &reason), 1);
        assert_eq!(
            msg.header("content-type").as_deref(),
            Some("text/plain; format=\"flowed\"")
        );
        assert!(matches!(serialize(&msg), Serialized::Ok(_)));
    }

    #[test]
    fn test_base64_part_skips_charset_check() {
        let raw: &[u8] = b"Content-Type: text/plain; charset=us-ascii\n\
Content-Transfer-Encoding: base64\n\
\n\
\xff\xfe\n";
        assert!(matches!(serialize(&parse_message(raw)), Serialized::Ok(_)));
    }

    #[test]
    fn test_invalid_utf8_charset() {
        assert!(!fits_charset("UTF-8", b"\xff\xfe"));
        assert!(fits_charset("utf-8", "ok ✓".as_bytes()));
        assert!(fits_charset("iso-8859-1", b"\xe9t\xe9"));
        assert!(fits_charset("x-unknown-charset", b"\xff"));
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let msg = parse_message(b"Subject: x\nnot a header\n\nBody\n");
        assert!(matches!(serialize(&msg), Serialized::Fatal(_)));
    }

    #[test]
    fn test_boundary_inside_leaf_is_fatal() {
        let mut msg = parse_message(
            b"Content-Type: multipart/mixed; boundary=b\n\n--b\n\nfirst\n--b--\n",
        );
        if let Some(part) = msg.part_mut(&[0]) {
            part.payload = Payload::Single(b"line\n--b\nsmuggled\n".to_vec());
        }
        assert!(matches!(serialize(&msg), Serialized::Fatal(_)));
    }

    #[test]
    fn test_charset_repair_covers_every_mislabeled_part() {
        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain; charset=us-ascii\n\
Content-Transfer-Encoding: 8bit\n\
\n\
caf\xc3\xa9\n\
--b\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: 8bit\n\
\n\
caf\xc3\xa9\n\
--b\n\
Content-Type: text/html; charset=us-ascii\n\
Content-Transfer-Encoding: 8bit\n\
\n\
<p>na\xc3\xafve</p>\n\
--b--\n";
        let mut msg = parse_message(raw);
        let Serialized::Recoverable(reason) = serialize(&msg) else {
            panic!("expected recoverable failure");
        };
        assert_eq!(repair(&mut msg, &reason), 2);
        assert!(matches!(serialize(&msg), Serialized::Ok(_)));
        let charset = |idx: usize| msg.part(&[idx]).and_then(|p| p.content_type_param("charset"));
        assert_eq!(charset(0), None);
        assert_eq!(charset(1).as_deref(), Some("utf-8"));
        assert_eq!(charset(2), None);
    }

    #[test]
    fn test_dash_line_that_is_not_a_delimiter_is_kept() {
        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain\n\
\n\
Thanks\n\
--best regards\n\
--b-- is not a close either\n\
--b--\n";
        let msg = parse_message(raw);
        assert_eq!(ok_bytes(serialize(&msg)), raw);
    }

    #[test]
    fn test_strip_charset() {
        assert_eq!(strip_charset("text/plain; charset=\"utf-8\""), "text/plain");
        assert_eq!(
            strip_charset("text/plain; CHARSET=latin1; delsp=yes"),
            "text/plain; delsp=\"yes\""
        );
    }
}
