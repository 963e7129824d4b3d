//! Centralized error types for mailmirror.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailmirror library.
#[derive(Error, Debug)]
pub enum BackupError {
    /// The Date or Message-ID of a message is missing or unusable.
    #[error("Bad metadata in folder '{folder}' (message id '{message_id}'): {reason}")]
    Metadata {
        folder: String,
        message_id: String,
        reason: String,
    },

    /// A remote listing or fetch failed.
    #[error("Remote {operation} failed in folder '{folder}': {reason}")]
    Remote {
        operation: &'static str,
        folder: String,
        reason: String,
    },

    /// The message could not be serialized, even after one repair pass.
    #[error("Cannot serialize message to '{path}': {reason}")]
    Serialization { path: PathBuf, reason: String },

    /// The fetched message does not derive the path computed during listing.
    #[error("Fetched message maps to '{fetched}', expected '{expected}'")]
    PathMismatch { expected: PathBuf, fetched: PathBuf },

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, BackupError>`.
pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Remote` variant.
    pub fn remote(operation: &'static str, folder: &str, reason: impl ToString) -> Self {
        Self::Remote {
            operation,
            folder: folder.to_string(),
            reason: reason.to_string(),
        }
    }

    /// `true` if the error only concerns the message being processed and the
    /// run may continue with the next one.
    ///
    /// `Remote` counts as message-scoped here; a listing failure is raised
    /// before the per-message loop and aborts the run on its own.
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self,
            Self::Metadata { .. }
                | Self::Remote { .. }
                | Self::Serialization { .. }
                | Self::PathMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_classification() {
        let meta = BackupError::Metadata {
            folder: "INBOX".into(),
            message_id: String::new(),
            reason: "missing Message-ID".into(),
        };
        assert!(meta.is_message_scoped());
        assert!(BackupError::remote("fetch", "INBOX", "timeout").is_message_scoped());

        let io = BackupError::io(
            "/backup/INBOX",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!io.is_message_scoped());
        assert!(!BackupError::Config("no host".into()).is_message_scoped());
    }

    #[test]
    fn test_remote_message_carries_context() {
        let err = BackupError::remote("list", "Sent Items", "NO [UNAVAILABLE]");
        let text = err.to_string();
        assert!(text.contains("list"));
        assert!(text.contains("Sent Items"));
        assert!(text.contains("NO [UNAVAILABLE]"));
    }
}
