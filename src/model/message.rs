//! Remote message metadata.

use super::body::MessageBody;

/// Identifies one remote message without its body.
///
/// `date` and `message_id` hold the raw header values. They are only parsed
/// when the local path is derived, so that a broken value fails that single
/// message instead of the whole listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageRef {
    /// Remote folder (mailbox) name, exactly as the server reports it.
    pub folder: String,

    /// The `Message-ID` header value, unfolded and trimmed.
    pub message_id: String,

    /// The `Date` header value, unfolded and trimmed.
    pub date: String,

    /// Decoded subject line (RFC 2047 encoded-words resolved).
    pub subject: String,

    /// Decoded `From:` header.
    pub from: String,

    /// Decoded `To:` header.
    pub to: String,
}

/// A message body fetched on demand, together with the metadata read from
/// its own headers.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub reference: MessageRef,
    pub body: MessageBody,
    /// The bytes as the server sent them.
    pub raw: Vec<u8>,
}

impl FetchedMessage {
    /// Build from the raw RFC 5322 bytes of a message living in `folder`.
    pub fn from_raw(folder: &str, raw: &[u8]) -> Self {
        Self {
            reference: crate::parser::header::message_ref(folder, raw),
            body: crate::parser::mime::parse_message(raw),
            raw: raw.to_vec(),
        }
    }
}
