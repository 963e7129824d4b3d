//! Raw-preserving MIME tree.
//!
//! A [`MessageBody`] keeps header fields and payload bytes exactly as they
//! arrived, so that serializing an untouched tree gives the original message
//! back. Only the pieces the writer needs to inspect or repair are modelled:
//! header fields, multipart boundaries and leaf payloads.

/// Line terminator used when re-emitting structural lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    /// Detect the terminator of the first line in `data` (LF if none).
    pub fn detect(data: &[u8]) -> Self {
        match data.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > 0 && data[pos - 1] == b'\r' => Self::CrLf,
            _ => Self::Lf,
        }
    }
}

/// One header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Field name as written (case preserved).
    pub name: String,

    /// Raw bytes after the colon, continuation lines included, final line
    /// terminator excluded. `None` for a line that had no colon at all.
    pub value: Option<Vec<u8>>,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: &str) -> Self {
        Self {
            name: name.into(),
            value: Some(value.as_bytes().to_vec()),
        }
    }

    /// The value with folding removed and whitespace trimmed.
    pub fn unfolded(&self) -> String {
        let raw = self.value.as_deref().unwrap_or_default();
        let text = String::from_utf8_lossy(raw);
        let mut out = String::with_capacity(text.len());
        for (i, line) in text.split('\n').enumerate() {
            let line = line.trim_end_matches('\r');
            if i > 0 {
                out.push(' ');
                out.push_str(line.trim_start());
            } else {
                out.push_str(line);
            }
        }
        out.trim().to_string()
    }
}

/// The content below the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A leaf part: the encoded body bytes, verbatim.
    Single(Vec<u8>),
    /// A `multipart/*` container.
    Multipart(Multipart),
}

/// A multipart container and its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    pub boundary: String,
    /// Text before the first delimiter. `None` when the body starts with it.
    pub preamble: Option<Vec<u8>>,
    pub parts: Vec<MessageBody>,
    /// Everything after the closing `--boundary--`, including its terminator.
    pub epilogue: Vec<u8>,
    /// `false` when the input ended without a closing delimiter.
    pub closed: bool,
}

/// A message or one of its MIME parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub headers: Vec<HeaderField>,
    pub payload: Payload,
    pub line_ending: LineEnding,
}

impl MessageBody {
    /// First value of a header (case-insensitive name), unfolded.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name) && h.value.is_some())
            .map(HeaderField::unfolded)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Replace the first field called `name`, or append a new one.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(field) => field.value = Some(value.as_bytes().to_vec()),
            None => self.headers.push(HeaderField::new(name, value)),
        }
    }

    /// Lowercased MIME type from `Content-Type` (e.g. `"text/plain"`).
    pub fn mime_type(&self) -> Option<String> {
        self.header("content-type").map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase()
        })
    }

    /// A parameter of the `Content-Type` field, unquoted.
    pub fn content_type_param(&self, param: &str) -> Option<String> {
        let ct = self.header("content-type")?;
        let found = content_type_params(&ct)
            .find(|(key, _)| key.eq_ignore_ascii_case(param))
            .map(|(_, value)| value);
        found
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.payload, Payload::Multipart(_))
    }

    /// Walk down the tree following child indexes.
    pub fn part(&self, path: &[usize]) -> Option<&MessageBody> {
        let mut node = self;
        for &idx in path {
            match &node.payload {
                Payload::Multipart(mp) => node = mp.parts.get(idx)?,
                Payload::Single(_) => return None,
            }
        }
        Some(node)
    }

    pub fn part_mut(&mut self, path: &[usize]) -> Option<&mut MessageBody> {
        let mut node = self;
        for &idx in path {
            match &mut node.payload {
                Payload::Multipart(mp) => node = mp.parts.get_mut(idx)?,
                Payload::Single(_) => return None,
            }
        }
        Some(node)
    }
}

/// Iterate `key=value` parameters of a structured header value, skipping the
/// leading type token.
pub fn content_type_params(value: &str) -> impl Iterator<Item = (String, String)> + '_ {
    value.split(';').skip(1).filter_map(|param| {
        let (key, val) = param.split_once('=')?;
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        Some((key.trim().to_string(), val.to_string()))
    })
}
