use std::path::PathBuf;
use std::time::Duration;

use driveshard_chunker::DEFAULT_CHUNK_SIZE;

/// Tuning knobs for the transfer engine.
///
/// Parsing these from a config file is the caller's problem; this struct
/// is the boundary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed chunk size; the last chunk of a file may be smaller.
    pub chunk_size_bytes: u64,
    /// Concurrent chunk workers per active transfer.
    pub workers: usize,
    /// Maximum attempts for a transiently failing chunk.
    pub max_retries: u32,
    /// Base delay for exponential backoff (`base × 2^attempt`).
    pub retry_base_delay: Duration,
    /// Queue-wide pause after a rate-limit error.
    pub rate_limit_pause: Duration,
    /// Directory for chunk artifacts and download staging.
    pub temp_dir: PathBuf,
    /// Remote folder prefix for chunk blobs.
    pub remote_folder: String,
}

impl EngineConfig {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            workers: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            rate_limit_pause: Duration::from_secs(30),
            temp_dir: temp_dir.into(),
            remote_folder: "driveshard".into(),
        }
    }

    /// Remote blob name for a chunk artifact file name.
    pub fn remote_name(&self, chunk_file_name: &str) -> String {
        format!("{}/{}", self.remote_folder, chunk_file_name)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("driveshard"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn remote_name_has_folder_prefix() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.remote_name("f.part0000.bin.chunk"),
            "driveshard/f.part0000.bin.chunk"
        );
    }
}
