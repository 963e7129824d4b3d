//! Export of live remote messages to other formats.

pub mod mbox;
