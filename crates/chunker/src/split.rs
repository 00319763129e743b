use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{ChunkerError, chunk_file_name};

/// Read buffer for streaming hash/split passes.
const READ_BUF_SIZE: usize = 64 * 1024;

/// One chunk artifact written to local disk during a split.
#[derive(Debug, Clone)]
pub struct ChunkArtifact {
    /// 0-based index; byte offset = index × chunk_size.
    pub index: usize,
    /// Local path of the artifact.
    pub path: PathBuf,
    /// Size of this chunk in bytes.
    pub size_bytes: u64,
    /// SHA-256 hex digest of this chunk's bytes.
    pub content_hash: String,
}

/// Result of splitting one file.
#[derive(Debug, Clone)]
pub struct SplitOutput {
    /// File name of the source (no directory components).
    pub file_name: String,
    /// Total size of the source in bytes.
    pub size_bytes: u64,
    /// SHA-256 hex digest of the entire source file.
    pub whole_file_hash: String,
    /// Chunk artifacts in index order.
    pub chunks: Vec<ChunkArtifact>,
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file by streaming it.
pub fn hash_file(path: &Path) -> Result<String, ChunkerError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recomputes a chunk artifact's hash and compares it to `expected_hash`.
///
/// Used on the download side right after a fetch, before the chunk is
/// accepted for merging.
pub fn verify_chunk(path: &Path, expected_hash: &str) -> Result<(), ChunkerError> {
    let actual = hash_file(path)?;
    if actual != expected_hash {
        return Err(ChunkerError::Integrity {
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Splits `path` into fixed-size chunk artifacts under `chunk_dir`.
///
/// Streams the source exactly once: the whole-file hash and every per-chunk
/// hash are computed in the same pass, and each window is written out as it
/// is read. The file is never loaded into memory as a whole.
///
/// All chunks except the last have exactly `chunk_size` bytes; chunk count
/// is `ceil(size / chunk_size)`. The source vanishing mid-read surfaces as
/// [`ChunkerError::Io`].
pub fn split_file(
    path: &Path,
    chunk_dir: &Path,
    chunk_size: u64,
) -> Result<SplitOutput, ChunkerError> {
    if chunk_size == 0 {
        return Err(ChunkerError::InvalidChunkSize);
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut file = File::open(path)?;
    let size_bytes = file.metadata()?.len();
    if size_bytes == 0 {
        return Err(ChunkerError::EmptySource(file_name));
    }

    std::fs::create_dir_all(chunk_dir)?;

    let mut whole_hasher = Sha256::new();
    let mut chunks = Vec::with_capacity(size_bytes.div_ceil(chunk_size) as usize);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut index = 0usize;
    let mut eof = false;

    while !eof {
        let artifact_path = chunk_dir.join(chunk_file_name(&file_name, index));
        let mut chunk_hasher = Sha256::new();
        let mut writer = BufWriter::new(File::create(&artifact_path)?);
        let mut written = 0u64;

        // Fill one window, hashing into both digests as we go.
        while written < chunk_size {
            let want = ((chunk_size - written) as usize).min(buf.len());
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                eof = true;
                break;
            }
            whole_hasher.update(&buf[..n]);
            chunk_hasher.update(&buf[..n]);
            writer.write_all(&buf[..n])?;
            written += n as u64;
        }
        writer.flush()?;

        if written == 0 {
            // The file size was an exact multiple of chunk_size; this
            // window is empty and must not become a chunk.
            drop(writer);
            std::fs::remove_file(&artifact_path)?;
            break;
        }

        chunks.push(ChunkArtifact {
            index,
            path: artifact_path,
            size_bytes: written,
            content_hash: hex::encode(chunk_hasher.finalize()),
        });
        index += 1;
    }

    let whole_file_hash = hex::encode(whole_hasher.finalize());
    debug!(
        file = %file_name,
        size = size_bytes,
        chunks = chunks.len(),
        "split complete"
    );

    Ok(SplitOutput {
        file_name,
        size_bytes,
        whole_file_hash,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn hash_bytes_deterministic() {
        let h1 = hash_bytes(b"hello world");
        let h2 = hash_bytes(b"hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn hash_file_matches_hash_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"content to hash";
        let path = write_file(dir.path(), "f.bin", data);
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(data));
    }

    #[test]
    fn split_chunk_count_and_sizes() {
        let dir = TempDir::new().unwrap();
        // 10 bytes, chunk size 4 → chunks of 4, 4, 2.
        let path = write_file(dir.path(), "f.bin", b"0123456789");
        let out = split_file(&path, &dir.path().join("chunks"), 4).unwrap();

        assert_eq!(out.size_bytes, 10);
        assert_eq!(out.chunks.len(), 3);
        assert_eq!(out.chunks[0].size_bytes, 4);
        assert_eq!(out.chunks[1].size_bytes, 4);
        assert_eq!(out.chunks[2].size_bytes, 2);
        assert_eq!(
            out.chunks.iter().map(|c| c.size_bytes).sum::<u64>(),
            out.size_bytes
        );
    }

    #[test]
    fn split_exact_multiple_has_no_empty_tail() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", b"12345678");
        let out = split_file(&path, &dir.path().join("chunks"), 4).unwrap();
        assert_eq!(out.chunks.len(), 2);
        assert!(out.chunks.iter().all(|c| c.size_bytes == 4));
    }

    #[test]
    fn split_single_chunk_when_file_smaller() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", b"abc");
        let out = split_file(&path, &dir.path().join("chunks"), 1024).unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].size_bytes, 3);
    }

    #[test]
    fn split_whole_file_hash_matches_streaming_hash() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1000u32).flat_map(|i| i.to_le_bytes()).collect();
        let path = write_file(dir.path(), "f.bin", &data);

        let out = split_file(&path, &dir.path().join("chunks"), 100).unwrap();
        assert_eq!(out.whole_file_hash, hash_file(&path).unwrap());
    }

    #[test]
    fn split_chunk_hashes_match_artifact_contents() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", b"abcdefghij");
        let out = split_file(&path, &dir.path().join("chunks"), 4).unwrap();

        for chunk in &out.chunks {
            assert_eq!(hash_file(&chunk.path).unwrap(), chunk.content_hash);
            verify_chunk(&chunk.path, &chunk.content_hash).unwrap();
        }
    }

    #[test]
    fn split_rejects_zero_chunk_size() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "f.bin", b"data");
        let err = split_file(&path, dir.path(), 0).unwrap_err();
        assert!(matches!(err, ChunkerError::InvalidChunkSize));
    }

    #[test]
    fn split_rejects_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "empty.bin", b"");
        let err = split_file(&path, dir.path(), 4).unwrap_err();
        assert!(matches!(err, ChunkerError::EmptySource(_)));
    }

    #[test]
    fn split_missing_source_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = split_file(&dir.path().join("nope.bin"), dir.path(), 4).unwrap_err();
        assert!(matches!(err, ChunkerError::Io(_)));
    }

    #[test]
    fn verify_chunk_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "c.chunk", b"original");
        let good = hash_file(&path).unwrap();
        verify_chunk(&path, &good).unwrap();

        std::fs::write(&path, b"tampered").unwrap();
        let err = verify_chunk(&path, &good).unwrap_err();
        assert!(matches!(err, ChunkerError::Integrity { .. }));
    }
}
