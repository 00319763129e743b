use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::ChunkerError;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Merges chunk artifacts in the given order into `output_path`.
///
/// Streams each chunk into the output while hashing incrementally. After
/// the last chunk the digest is compared against `expected_hash`; on
/// mismatch the partially written output is deleted and
/// [`ChunkerError::Integrity`] is returned. A missing chunk artifact
/// likewise removes the partial output.
///
/// Returns the hex digest of the reassembled file (equal to
/// `expected_hash` on success).
pub fn merge_chunks(
    ordered_paths: &[impl AsRef<Path>],
    output_path: &Path,
    expected_hash: &str,
) -> Result<String, ChunkerError> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = merge_inner(ordered_paths, output_path, expected_hash);
    if result.is_err() {
        remove_partial(output_path);
    }
    result
}

fn merge_inner(
    ordered_paths: &[impl AsRef<Path>],
    output_path: &Path,
    expected_hash: &str,
) -> Result<String, ChunkerError> {
    let mut hasher = Sha256::new();
    let mut writer = BufWriter::new(File::create(output_path)?);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    for (index, chunk_path) in ordered_paths.iter().enumerate() {
        let chunk_path = chunk_path.as_ref();
        let mut chunk = match File::open(chunk_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkerError::MissingChunk { index });
            }
            Err(e) => return Err(e.into()),
        };

        loop {
            let n = chunk.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n])?;
        }
    }

    writer.flush()?;
    let actual = hex::encode(hasher.finalize());
    if actual != expected_hash {
        return Err(ChunkerError::Integrity {
            expected: expected_hash.to_string(),
            actual,
        });
    }

    debug!(output = %output_path.display(), chunks = ordered_paths.len(), "merge complete");
    Ok(actual)
}

fn remove_partial(output_path: &Path) {
    if let Err(e) = std::fs::remove_file(output_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %output_path.display(), error = %e, "failed to remove partial output");
        }
    }
}
