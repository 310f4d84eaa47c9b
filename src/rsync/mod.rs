//! Client side of rsync wire protocol 27: plaintext handshake, multiplexed
//! framing, delta-encoded file list, and the index-driven transfer phase.

pub mod checksum;
pub mod downloader;
pub mod envelope;
pub mod file_list;
pub mod filter;
pub mod generator;
pub mod handshake;

/// Index terminator exchanged in both directions at the end of the transfer
/// phase.
pub const INDEX_END: i32 = -1;
