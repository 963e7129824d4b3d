//! Core data model: remote message references and the MIME tree written to disk.

pub mod body;
pub mod message;
