//! Storage backend capability and the round-robin placement registry.
//!
//! `StorageBackend` is implemented per storage account (a cloud drive, a
//! mounted disk, ...). Using a trait keeps transfer logic decoupled from
//! transport and testable with mocks. Errors are a closed tagged enum so
//! callers classify failures with a plain `match` instead of inspecting
//! message strings.

mod local;
mod registry;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

pub use local::LocalDirBackend;
pub use registry::{BackendRegistry, RegistryError};

/// Errors produced by a storage backend.
///
/// The variant *is* the classification: `Transient` and `RateLimited` are
/// retryable (the latter backend-account-wide), `Auth` is terminal,
/// `NotFound` means the remote object does not exist.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Health of a backend as reported by a pre-flight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    AuthError,
    RateLimited,
    Unreachable,
}

/// A named, interchangeable storage destination.
///
/// Implementations wrap whatever transport reaches the actual account; the
/// engine only ever calls these four operations plus `id()`.
pub trait StorageBackend: Send + Sync {
    /// Stable identifier for this backend instance.
    fn id(&self) -> &str;

    /// Uploads the file at `local` as the blob `remote_name`.
    fn store(
        &self,
        local: &Path,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>>;

    /// Downloads the blob `remote_name` to the file at `local`.
    fn fetch(
        &self,
        remote_name: &str,
        local: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>>;

    /// Deletes the blob `remote_name`.
    fn delete(
        &self,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>>;

    /// Checks whether the backend is currently usable.
    fn probe(&self) -> Pin<Box<dyn Future<Output = BackendHealth> + Send + '_>>;
}
