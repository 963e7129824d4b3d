//! In-memory remote store.
//!
//! Holds raw messages per folder and answers listings and fetches from them.
//! Failures can be injected to exercise the reconciler's error paths.

use std::collections::HashSet;

use crate::error::{BackupError, Result};
use crate::model::message::{FetchedMessage, MessageRef};
use crate::parser::header;
use crate::remote::{FolderFilter, RemoteInventory};

#[derive(Debug, Clone)]
struct StoredMessage {
    folder: String,
    raw: Vec<u8>,
    /// Header block served by listings instead of `raw`, when set.
    listed: Option<Vec<u8>>,
    deleted: bool,
}

impl StoredMessage {
    fn listing(&self) -> MessageRef {
        header::message_ref(&self.folder, self.listed.as_deref().unwrap_or(&self.raw))
    }
}

/// A [`RemoteInventory`] backed by a vector of raw messages.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    messages: Vec<StoredMessage>,
    fail_listing: Option<String>,
    fail_fetch: HashSet<String>,
    fetches: usize,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live message to `folder`.
    pub fn add(&mut self, folder: &str, raw: impl Into<Vec<u8>>) -> &mut Self {
        self.messages.push(StoredMessage {
            folder: folder.to_string(),
            raw: raw.into(),
            listed: None,
            deleted: false,
        });
        self
    }

    /// Flag every message with this Message-ID as deleted.
    pub fn delete(&mut self, message_id: &str) -> usize {
        let mut count = 0;
        for msg in &mut self.messages {
            if header::message_ref(&msg.folder, &msg.raw).message_id == message_id {
                msg.deleted = true;
                count += 1;
            }
        }
        count
    }

    /// List the message with this Message-ID using `headers` instead of its
    /// own header block, like a server whose envelope disagrees with the
    /// message it returns on fetch.
    pub fn list_with_headers(&mut self, message_id: &str, headers: impl Into<Vec<u8>>) -> usize {
        let headers = headers.into();
        let mut count = 0;
        for msg in &mut self.messages {
            if header::message_ref(&msg.folder, &msg.raw).message_id == message_id {
                msg.listed = Some(headers.clone());
                count += 1;
            }
        }
        count
    }

    /// Make the next listings fail with `reason`.
    pub fn fail_listing(&mut self, reason: &str) {
        self.fail_listing = Some(reason.to_string());
    }

    /// Make fetches of this Message-ID fail.
    pub fn fail_fetch(&mut self, message_id: &str) {
        self.fail_fetch.insert(message_id.to_string());
    }

    /// Number of `fetch_body` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    fn folders(&self) -> Vec<&str> {
        let mut folders: Vec<&str> = Vec::new();
        for msg in &self.messages {
            if !folders.contains(&msg.folder.as_str()) {
                folders.push(&msg.folder);
            }
        }
        folders
    }
}

impl RemoteInventory for MemoryInventory {
    fn list_live(&mut self, filter: &FolderFilter) -> Result<Vec<MessageRef>> {
        if let Some(reason) = &self.fail_listing {
            return Err(BackupError::remote("list", "*", reason));
        }

        let mut refs = Vec::new();
        for folder in self.folders() {
            if !filter.admits(folder) {
                continue;
            }
            refs.extend(
                self.messages
                    .iter()
                    .filter(|m| m.folder == folder && !m.deleted)
                    .map(StoredMessage::listing),
            );
        }
        Ok(refs)
    }

    fn fetch_body(&mut self, folder: &str, message_id: &str) -> Result<FetchedMessage> {
        self.fetches += 1;
        if self.fail_fetch.contains(message_id) {
            return Err(BackupError::remote("fetch", folder, "injected failure"));
        }

        self.messages
            .iter()
            .filter(|m| m.folder == folder && !m.deleted)
            .map(|m| FetchedMessage::from_raw(folder, &m.raw))
            .find(|f| f.reference.message_id == message_id)
            .ok_or_else(|| {
                BackupError::remote("fetch", folder, format!("no message {message_id}"))
            })
    }
}
