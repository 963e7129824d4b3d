//! Message parsing: header extraction for listings and the raw-preserving MIME tree.

pub mod header;
pub mod mime;
