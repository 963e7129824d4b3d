//! Atomic `.eml` writer.
//!
//! The message is serialized in memory first, written to `<path>~`, and then
//! renamed onto `<path>`. A reader never sees a partial file at the final
//! path, and a failed serialization leaves nothing behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BackupError, Result};
use crate::model::body::MessageBody;
use crate::store::serialize::{self, RepairReason, Serialized};

/// What a successful write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes written to the final file.
    pub bytes: u64,
    /// The repair applied before the write succeeded, if any.
    pub repaired: Option<RepairReason>,
}

/// Writes one message per call.
#[derive(Debug, Clone)]
pub struct MessageWriter {
    /// `fsync` the temporary file before renaming it.
    fsync: bool,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self { fsync: true }
    }
}

impl MessageWriter {
    pub fn new(fsync: bool) -> Self {
        Self { fsync }
    }

    /// Serialize `body` and move it into place at `path`.
    ///
    /// A recoverable serialization failure gets exactly one repair and one
    /// retry; anything else is a [`BackupError::Serialization`] and no file is
    /// created. Filesystem failures are [`BackupError::Io`].
    pub fn write(&self, path: &Path, mut body: MessageBody) -> Result<WriteOutcome> {
        let serialization_error = |reason: String| BackupError::Serialization {
            path: path.to_path_buf(),
            reason,
        };

        let (bytes, repaired) = match serialize::serialize(&body) {
            Serialized::Ok(bytes) => (bytes, None),
            Serialized::Fatal(reason) => return Err(serialization_error(reason)),
            Serialized::Recoverable(reason) => {
                let changed = serialize::repair(&mut body, &reason);
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    parts = changed,
                    "Repairing message before writing"
                );
                match serialize::serialize(&body) {
                    Serialized::Ok(bytes) => (bytes, Some(reason)),
                    Serialized::Recoverable(again) => {
                        return Err(serialization_error(format!(
                            "still failing after repair: {again}"
                        )))
                    }
                    Serialized::Fatal(reason) => return Err(serialization_error(reason)),
                }
            }
        };

        self.commit(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Message written");

        Ok(WriteOutcome {
            bytes: bytes.len() as u64,
            repaired,
        })
    }

    /// Write `bytes` to the temporary sibling and rename it onto `path`.
    fn commit(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }

        let tmp = temp_path_for(path);
        let result = self.write_temp(&tmp, bytes).and_then(|()| {
            fs::rename(&tmp, path).map_err(|e| BackupError::io(path, e))
        });

        if result.is_err() {
            // Leave no half-written sibling for the sweep to quarantine.
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn write_temp(&self, tmp: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = File::create(tmp).map_err(|e| BackupError::io(tmp, e))?;
        file.write_all(bytes).map_err(|e| BackupError::io(tmp, e))?;
        file.flush().map_err(|e| BackupError::io(tmp, e))?;
        if self.fsync {
            file.sync_all().map_err(|e| BackupError::io(tmp, e))?;
        }
        Ok(())
    }
}

/// The temporary sibling used while writing: `<path>~`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::mime::parse_message;

    const EIGHT_BIT_NO_CTE: &[u8] = b"Subject: repaired\n\
Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
caf\xc3\xa9\n\
--b--\n";

    #[test]
    fn test_write_plain_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("INBOX/2024/msg.eml");
        let raw: &[u8] = b"Subject: hello\n\nBody\n";

        let outcome = MessageWriter::new(false)
            .write(&path, parse_message(raw))
            .unwrap();

        assert_eq!(outcome.bytes, raw.len() as u64);
        assert!(outcome.repaired.is_none());
        assert_eq!(std::fs::read(&path).unwrap(), raw);
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_overwrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.eml");
        let raw: &[u8] = b"Subject: hello\n\nBody\n";
        let writer = MessageWriter::default();

        writer.write(&path, parse_message(raw)).unwrap();
        writer.write(&path, parse_message(raw)).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), raw);
    }

    #[test]
    fn test_repair_then_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.eml");

        let outcome = MessageWriter::new(false)
            .write(&path, parse_message(EIGHT_BIT_NO_CTE))
            .unwrap();

        assert_eq!(
            outcome.repaired,
            Some(RepairReason::MissingTransferEncoding { part: vec![0] })
        );
        let written = std::fs::read(&path).unwrap();
        assert!(String::from_utf8_lossy(&written).contains("Content-Transfer-Encoding:\n"));
        let parsed = mail_parser::MessageParser::default().parse(&written[..]);
        assert!(parsed.is_some(), "written file should parse");
        assert_eq!(parsed.unwrap().subject(), Some("repaired"));
    }

    #[test]
    fn test_fatal_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/msg.eml");

        let err = MessageWriter::new(false)
            .write(&path, parse_message(b"Bad header line\n\nBody\n"))
            .unwrap_err();

        assert!(matches!(err, BackupError::Serialization { .. }));
        assert!(!path.exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_second_failure_after_repair_is_fatal() {
        // Repairing the missing transfer encoding exposes the charset problem,
        // which gets no second repair.
        let raw: &[u8] = b"Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
Content-Type: text/plain; charset=us-ascii\n\
\n\
caf\xc3\xa9\n\
--b--\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.eml");

        let err = MessageWriter::new(false)
            .write(&path, parse_message(raw))
            .unwrap_err();

        match err {
            BackupError::Serialization { reason, .. } => {
                assert!(reason.contains("after repair"));
            }
            other => panic!("expected serialization error, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path_for(Path::new("/b/INBOX/2024/x.eml")),
            PathBuf::from("/b/INBOX/2024/x.eml~")
        );
    }
}
