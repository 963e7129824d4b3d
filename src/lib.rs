//! `mailmirror`: incremental IMAP backup to a directory tree of `.eml` files.
//!
//! Every live remote message maps to one deterministic local path. A run
//! downloads what is missing, leaves what is present alone, and moves local
//! files whose message disappeared from the server into a per-directory
//! quarantine folder.

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod parser;
pub mod remote;
pub mod store;
pub mod sync;
