//! Local backup tree: path derivation, atomic writes and the quarantine sweep.

pub mod live;
pub mod path;
pub mod quarantine;
pub mod serialize;
pub mod writer;
