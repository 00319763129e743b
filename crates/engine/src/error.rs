//! Engine error taxonomy and failure classification.

use driveshard_backend::{BackendError, RegistryError};
use driveshard_chunker::ChunkerError;
use driveshard_manifest::ManifestError;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunker error: {0}")]
    Chunker(#[from] ChunkerError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("no backends enabled")]
    NoBackends,

    #[error("backend error on {file_id} chunk {chunk_index} ({backend_id}): {source}")]
    Backend {
        file_id: String,
        chunk_index: usize,
        backend_id: String,
        source: BackendError,
    },

    #[error(
        "chunk {chunk_index} of {file_id} failed after {attempts} attempts: {last_error}"
    )]
    RetriesExhausted {
        file_id: String,
        chunk_index: usize,
        attempts: u32,
        last_error: String,
    },

    #[error("backend {backend_id} failed its pre-flight probe: {source}")]
    Preflight {
        backend_id: String,
        source: BackendError,
    },

    #[error("integrity failure: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,
}

/// How a failure should be handled by the retry coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the failing chunk with exponential backoff.
    Transient,
    /// Backend-account-wide throttling: pause the whole queue and retry
    /// the batch later.
    RateLimit,
    /// Useless to retry automatically; surface to the user.
    Terminal,
}

/// Classifies a raw backend error.
pub fn classify_backend(err: &BackendError) -> ErrorClass {
    match err {
        BackendError::Transient(_) | BackendError::Io(_) => ErrorClass::Transient,
        BackendError::RateLimited(_) => ErrorClass::RateLimit,
        // A blob that is gone will not reappear on retry.
        BackendError::Auth(_) | BackendError::NotFound(_) => ErrorClass::Terminal,
    }
}

/// Classifies an engine error for queue-level handling.
pub fn classify(err: &EngineError) -> ErrorClass {
    match err {
        EngineError::Backend { source, .. } | EngineError::Preflight { source, .. } => {
            classify_backend(source)
        }
        // Source-file I/O during chunking: the file is gone, do not retry.
        EngineError::Io(_) | EngineError::Chunker(_) => ErrorClass::Terminal,
        EngineError::Manifest(_)
        | EngineError::Registry(_)
        | EngineError::ManifestNotFound(_)
        | EngineError::NoBackends
        | EngineError::Integrity { .. }
        | EngineError::Cancelled => ErrorClass::Terminal,
        EngineError::RetriesExhausted { .. } => ErrorClass::Terminal,
    }
}
