//! Storage infrastructure: configuration and protocol library files.
//!
//! - `config` reads and writes the viewer's TOML settings, falling back to
//!   defaults when the file does not exist yet.
//! - `protocol_library` loads hanging protocols from TOML documents, merges
//!   them over the built-in set, and rejects protocols that could never be
//!   applied.

pub mod config;
pub mod protocol_library;
