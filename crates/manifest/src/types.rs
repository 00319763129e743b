//! Serde types for the persisted manifest record.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Lifecycle state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Stored,
    Failed,
}

/// Lifecycle state of the whole file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Created,
    Chunking,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

/// One chunk's placement and state within a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// 0-based index; defines the reconstruction order.
    pub index: usize,
    /// Deterministic remote object name for this chunk.
    pub remote_name: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest of this chunk's bytes.
    pub content_hash: String,
    /// Id of the backend that owns this chunk. Assigned once at placement
    /// time and never reassigned.
    pub backend_id: String,
    pub status: ChunkStatus,
}

/// Identity of the original file a manifest describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalFile {
    pub file_name: String,
    pub original_path: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest of the entire file.
    pub whole_file_hash: String,
}

/// The durable record mapping a file to its ordered chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub original_file: OriginalFile,
    /// Ordered by index; never reordered.
    pub chunks: Vec<ChunkRecord>,
    pub status: FileStatus,
}

impl Manifest {
    /// Creates a fresh manifest in `Created` state.
    pub fn new(id: String, original_file: OriginalFile, chunks: Vec<ChunkRecord>) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: MANIFEST_VERSION,
            created_at: now,
            updated_at: now,
            original_file,
            chunks,
            status: FileStatus::Created,
        }
    }

    /// Derives a manifest id from the file name and a timestamp, e.g.
    /// `"backup_20260829_153000"` for `backup.tar`.
    pub fn derive_id(file_name: &str, now: NaiveDateTime) -> String {
        let stem = match file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file_name,
        };
        format!("{stem}_{}", now.format("%Y%m%d_%H%M%S"))
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks currently in `Stored` state.
    pub fn stored_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Stored)
            .count()
    }

    /// `true` once every chunk is stored.
    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.stored_chunks() == self.total_chunks()
    }
}
