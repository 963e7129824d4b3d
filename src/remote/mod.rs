//! Remote mail store access, as consumed by the reconciler.
//!
//! The reconciler only needs two operations: list every live message
//! (metadata only) and fetch one full message on demand. Connection
//! handling, authentication, retries and pacing belong to the implementations.

pub mod imap;
pub mod memory;

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::message::{FetchedMessage, MessageRef};

/// Which remote folders take part in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderFilter {
    /// Restrict the run to this single folder.
    pub only: Option<String>,
    /// Folders excluded from listing and from the sweep.
    pub ignore: BTreeSet<String>,
}

impl FolderFilter {
    /// `true` if messages of `folder` should be listed.
    pub fn admits(&self, folder: &str) -> bool {
        if self.ignore.contains(folder) {
            return false;
        }
        self.only.as_deref().map_or(true, |only| only == folder)
    }
}

/// A remote store holding the messages to mirror.
pub trait RemoteInventory {
    /// List all non-deleted messages in the folders admitted by `filter`,
    /// in server order. A failure here aborts the whole run.
    fn list_live(&mut self, filter: &FolderFilter) -> Result<Vec<MessageRef>>;

    /// Fetch the full message identified by `message_id` in `folder`.
    fn fetch_body(&mut self, folder: &str, message_id: &str) -> Result<FetchedMessage>;
}

impl<T: RemoteInventory + ?Sized> RemoteInventory for Box<T> {
    fn list_live(&mut self, filter: &FolderFilter) -> Result<Vec<MessageRef>> {
        (**self).list_live(filter)
    }

    fn fetch_body(&mut self, folder: &str, message_id: &str) -> Result<FetchedMessage> {
        (**self).fetch_body(folder, message_id)
    }
}
