//! File splitting and merging with SHA-256 content hashing.
//!
//! A file is split into fixed-size chunks (the last one may be smaller),
//! each hashed independently, while the whole-file hash is computed in the
//! same streaming pass. Merging reverses the split and verifies the
//! reassembled file against the recorded whole-file hash.
//!
//! Everything here is synchronous `std::fs` streaming — callers running
//! inside a tokio runtime wrap these in `spawn_blocking`.

mod merge;
mod split;

pub use merge::merge_chunks;
pub use split::{
    ChunkArtifact, SplitOutput, hash_bytes, hash_file, split_file, verify_chunk,
};

/// Default chunk size: 100 MiB.
///
/// Large chunks keep per-chunk overhead (hashing, remote round trips,
/// manifest entries) low while still spreading a multi-gigabyte file
/// across several backends.
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Errors produced by the chunker crate.
#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("chunk size must be non-zero")]
    InvalidChunkSize,

    #[error("source file is empty: {0}")]
    EmptySource(String),

    #[error("chunk artifact missing: index {index}")]
    MissingChunk { index: usize },
}

/// Returns the deterministic artifact name for chunk `index` of `file_name`.
///
/// The rule is `"{stem}.part{index:04}{ext}.chunk"`, e.g.
/// `backup.part0003.tar.chunk` for `backup.tar`. The name is stable across
/// re-runs, so a re-upload addresses the same remote objects.
pub fn chunk_file_name(file_name: &str, index: usize) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{stem}.part{index:04}.{ext}.chunk")
        }
        _ => format!("{file_name}.part{index:04}.chunk"),
    }
}
