//! Raw-preserving MIME parsing: splits a message into header fields and a
//! tree of parts without decoding anything.

use crate::model::body::{HeaderField, LineEnding, MessageBody, Multipart, Payload};

/// Maximum nesting of multipart containers (deeper parts are kept as leaves).
const MAX_DEPTH: usize = 10;

/// Parse a complete raw message into a [`MessageBody`].
///
/// Never fails: anything that does not look like MIME structure is kept as
/// an opaque leaf payload.
pub fn parse_message(raw: &[u8]) -> MessageBody {
    parse_entity(raw, LineEnding::detect(raw), 0)
}

fn parse_entity(data: &[u8], eol: LineEnding, depth: usize) -> MessageBody {
    let (headers, body) = split_headers(data);

    let mut entity = MessageBody {
        headers,
        payload: Payload::Single(Vec::new()),
        line_ending: eol,
    };

    let is_multipart = entity
        .mime_type()
        .is_some_and(|t| t.starts_with("multipart/"));
    let boundary = entity.content_type_param("boundary").filter(|b| !b.is_empty());

    entity.payload = match boundary {
        Some(boundary) if is_multipart && depth < MAX_DEPTH => {
            parse_multipart(body, &boundary, eol, depth)
                .map(Payload::Multipart)
                .unwrap_or_else(|| Payload::Single(body.to_vec()))
        }
        _ => Payload::Single(body.to_vec()),
    };

    entity
}

/// Split an entity into header fields and the body slice that follows the
/// blank separator line.
fn split_headers(data: &[u8]) -> (Vec<HeaderField>, &[u8]) {
    let mut headers: Vec<HeaderField> = Vec::new();
    // Terminator of the last line appended to the current field.
    let mut pending_eol: &[u8] = b"";
    let mut pos = 0;

    while pos < data.len() {
        let (content, terminator, next) = next_line(data, pos);

        if content.is_empty() {
            return (headers, &data[next..]);
        }

        let continuation = content[0] == b' ' || content[0] == b'\t';
        let folded = match headers.last_mut() {
            Some(HeaderField {
                value: Some(value), ..
            }) if continuation => {
                value.extend_from_slice(pending_eol);
                value.extend_from_slice(content);
                true
            }
            _ => false,
        };
        if !folded {
            headers.push(parse_field(content));
        }

        pending_eol = terminator;
        pos = next;
    }

    (headers, &data[data.len()..])
}

fn parse_field(line: &[u8]) -> HeaderField {
    match line.iter().position(|&b| b == b':') {
        Some(colon) => HeaderField {
            name: String::from_utf8_lossy(&line[..colon]).into_owned(),
            value: Some(line[colon + 1..].to_vec()),
        },
        None => HeaderField {
            name: String::from_utf8_lossy(line).into_owned(),
            value: None,
        },
    }
}

/// Return `(content, terminator, next_position)` for the line starting at `pos`.
fn next_line(data: &[u8], pos: usize) -> (&[u8], &[u8], usize) {
    match data[pos..].iter().position(|&b| b == b'\n') {
        Some(rel) => {
            let nl = pos + rel;
            let content_end = if nl > pos && data[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };
            (&data[pos..content_end], &data[content_end..=nl], nl + 1)
        }
        None => (&data[pos..], b"", data.len()),
    }
}

/// A delimiter line found in a multipart body.
struct Delimiter {
    /// Offset of the first byte of the line.
    start: usize,
    /// Offset just after the line terminator.
    next: usize,
    closing: bool,
}

/// Classify one line (terminator excluded or included) against `boundary`:
/// `Some(false)` for a delimiter, `Some(true)` for the closing delimiter,
/// `None` for anything else. Trailing whitespace after the marker is allowed.
pub(crate) fn delimiter_kind(line: &[u8], boundary: &str) -> Option<bool> {
    let rest = line
        .strip_prefix(b"--")?
        .strip_prefix(boundary.as_bytes())?
        .trim_ascii_end();
    match rest {
        b"" => Some(false),
        b"--" => Some(true),
        _ => None,
    }
}

fn find_delimiters(data: &[u8], boundary: &str) -> Vec<Delimiter> {
    let mut found = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (content, _, next) = next_line(data, pos);
        if let Some(closing) = delimiter_kind(content, boundary) {
            found.push(Delimiter {
                start: pos,
                next,
                closing,
            });
            if closing {
                break;
            }
        }
        pos = next;
    }

    found
}

/// Length of the line terminator that ends right before `offset`.
fn eol_len_before(data: &[u8], offset: usize) -> usize {
    if offset >= 2 && &data[offset - 2..offset] == b"\r\n" {
        2
    } else if offset >= 1 && data[offset - 1] == b'\n' {
        1
    } else {
        0
    }
}

fn parse_multipart(
    body: &[u8],
    boundary: &str,
    eol: LineEnding,
    depth: usize,
) -> Option<Multipart> {
    let delimiters = find_delimiters(body, boundary);
    let first = delimiters.first()?;
    if first.closing {
        return None;
    }

    let preamble = (first.start > 0)
        .then(|| body[..first.start - eol_len_before(body, first.start)].to_vec());

    let mut parts = Vec::new();
    let mut closed = false;
    let mut epilogue = Vec::new();

    for (i, delim) in delimiters.iter().enumerate() {
        if delim.closing {
            closed = true;
            let marker_end = delim.start + boundary.len() + 4;
            epilogue = body[marker_end.min(body.len())..].to_vec();
            break;
        }
        let content = match delimiters.get(i + 1) {
            Some(next) => {
                let end = next.start - eol_len_before(body, next.start);
                &body[delim.next..end.max(delim.next)]
            }
            None => &body[delim.next..],
        };
        parts.push(parse_entity(content, eol, depth + 1));
    }

    Some(Multipart {
        boundary: boundary.to_string(),
        preamble,
        parts,
        epilogue,
        closed,
    })
}
