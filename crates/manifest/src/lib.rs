//! Manifest data model and durable store.
//!
//! A manifest is the single source of truth for one transferred file: its
//! whole-file hash, the ordered list of chunks, where each chunk lives and
//! what state it is in. Manifests are persisted as one JSON file per id and
//! every mutation is durable before the mutating call returns.

mod store;
mod types;

pub use store::ManifestStore;
pub use types::{
    ChunkRecord, ChunkStatus, FileStatus, MANIFEST_VERSION, Manifest, OriginalFile,
};

/// Errors produced by the manifest crate.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("manifest already exists: {0}")]
    AlreadyExists(String),

    #[error("chunk index {index} out of range (manifest {id} has {total} chunks)")]
    ChunkIndexOutOfRange {
        id: String,
        index: usize,
        total: usize,
    },
}
