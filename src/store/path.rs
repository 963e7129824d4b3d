//! Deterministic local paths for remote messages.
//!
//! The path is the only index: `Folder/Year/Timestamp_MessageId.eml`, derived
//! from metadata alone. Two references with the same folder, date and
//! Message-ID always land on the same file.

use std::path::PathBuf;

use crate::error::{BackupError, Result};
use crate::model::message::MessageRef;
use crate::parser::header::parse_date;

/// Characters removed from a Message-ID before it becomes part of a filename.
const STRIPPED_ID_CHARS: [char; 5] = ['<', '>', '%', '/', ' '];

/// Derive the path of a message relative to the backup root.
///
/// Fails with [`BackupError::Metadata`] when the date cannot be parsed or the
/// Message-ID is empty.
pub fn derive(reference: &MessageRef) -> Result<PathBuf> {
    let metadata_error = |reason: String| BackupError::Metadata {
        folder: reference.folder.clone(),
        message_id: reference.message_id.clone(),
        reason,
    };

    let date = parse_date(&reference.date)
        .ok_or_else(|| metadata_error(format!("unparseable Date '{}'", reference.date)))?;

    let id = sanitize_message_id(&reference.message_id);
    if id.is_empty() {
        return Err(metadata_error("missing Message-ID".to_string()));
    }

    let timestamp = date.format("%Y-%m-%d_%H.%M_utc%z");
    let year = date.format("%Y").to_string();

    Ok(PathBuf::from(local_folder_name(&reference.folder))
        .join(year)
        .join(format!("{timestamp}_{id}.eml")))
}

/// Local directory name of a remote folder: spaces become underscores,
/// nothing else is touched.
pub fn local_folder_name(folder: &str) -> String {
    folder.replace(' ', "_")
}

/// Strip `<`, `>`, `%`, `/` and spaces; every other character is kept.
pub fn sanitize_message_id(message_id: &str) -> String {
    message_id
        .trim()
        .chars()
        .filter(|c| !STRIPPED_ID_CHARS.contains(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(folder: &str, id: &str, date: &str) -> MessageRef {
        MessageRef {
            folder: folder.to_string(),
            message_id: id.to_string(),
            date: date.to_string(),
            subject: String::new(),
            from: String::new(),
            to: String::new(),
        }
    }

    #[test]
    fn test_derive_layout() {
        let r = reference(
            "Sent Items",
            "<abc.123@example.com>",
            "Tue, 05 Mar 2024 14:07:09 +0100",
        );
        assert_eq!(
            derive(&r).unwrap(),
            PathBuf::from("Sent_Items/2024/2024-03-05_14.07_utc+0100_abc.123@example.com.eml")
        );
    }

    #[test]
    fn test_derive_uses_message_offset_not_utc() {
        // 23:30 at -0500 is already the next day in UTC; the path keeps the local view.
        let r = reference("INBOX", "<x@y>", "Tue, 31 Dec 2024 23:30:00 -0500");
        assert_eq!(
            derive(&r).unwrap(),
            PathBuf::from("INBOX/2024/2024-12-31_23.30_utc-0500_x@y.eml")
        );
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = reference("INBOX", "<same@id>", "Mon, 1 Jan 2024 00:00:00 +0000");
        let mut b = a.clone();
        b.subject = "different subject".into();
        b.from = "someone else".into();
        assert_eq!(derive(&a).unwrap(), derive(&b).unwrap());
        assert_eq!(derive(&a).unwrap(), derive(&a).unwrap());
    }

    #[test]
    fn test_sanitize_message_id() {
        assert_eq!(sanitize_message_id(" <a%b/c d@e> "), "abcd@e");
        assert_eq!(sanitize_message_id("<we:ird*chars?@x>"), "we:ird*chars?@x");
        assert_eq!(sanitize_message_id("<>"), "");
    }

    #[test]
    fn test_folder_separator_not_sanitized() {
        let r = reference("Archive/2019 old", "<id@x>", "Mon, 1 Jan 2024 00:00:00 +0000");
        let path = derive(&r).unwrap();
        assert!(path.starts_with("Archive/2019_old/2024"));
    }

    #[test]
    fn test_bad_date_is_metadata_error() {
        let r = reference("INBOX", "<id@x>", "yesterday-ish");
        match derive(&r) {
            Err(BackupError::Metadata { folder, reason, .. }) => {
                assert_eq!(folder, "INBOX");
                assert!(reason.contains("yesterday-ish"));
            }
            other => panic!("expected metadata error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_message_id_is_metadata_error() {
        let r = reference("INBOX", "  <> ", "Mon, 1 Jan 2024 00:00:00 +0000");
        assert!(matches!(derive(&r), Err(BackupError::Metadata { .. })));
    }
}
