//! Ordered registry of enabled backends with a round-robin placement cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{BackendHealth, StorageBackend};

/// Errors produced by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A manifest references a backend that is no longer configured.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("duplicate backend id: {0}")]
    DuplicateId(String),
}

/// Holds the enabled backend handles in a stable order.
///
/// Placement is round-robin: with N backends, the i-th call to
/// [`next_backend`](Self::next_backend) after a fresh cursor returns
/// `backends[i mod N]`. The cursor only moves during chunk placement,
/// which happens for a single active upload at a time.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn StorageBackend>>,
    cursor: AtomicUsize,
}

impl BackendRegistry {
    /// Builds a registry from the enabled backends, preserving their order.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Result<Self, RegistryError> {
        for (i, b) in backends.iter().enumerate() {
            if backends[..i].iter().any(|other| other.id() == b.id()) {
                return Err(RegistryError::DuplicateId(b.id().to_string()));
            }
        }
        Ok(Self {
            backends,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Ids of the enabled backends, in placement order.
    pub fn ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    /// Advances the round-robin cursor and returns the chosen backend's id.
    ///
    /// Panics if the registry is empty; callers check `is_empty()` before
    /// starting a placement run.
    pub fn next_backend(&self) -> String {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.backends[i % self.backends.len()].id().to_string()
    }

    /// Resets the cursor so the next placement run starts at `backends[0]`.
    ///
    /// Makes placement deterministic per file: chunk `i` lands on
    /// `backends[i mod N]`.
    pub fn reset_cursor(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    /// Resolves a backend id to its handle.
    ///
    /// Fails with [`RegistryError::UnknownBackend`] so a download of a
    /// chunk whose backend was disabled surfaces clearly instead of being
    /// silently skipped.
    pub fn resolve(&self, backend_id: &str) -> Result<Arc<dyn StorageBackend>, RegistryError> {
        self.backends
            .iter()
            .find(|b| b.id() == backend_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend(backend_id.to_string()))
    }

    /// Probes every backend, returning `(id, health)` pairs in order.
    ///
    /// Used as a pre-flight check before starting a batch.
    pub async fn probe_all(&self) -> Vec<(String, BackendHealth)> {
        let mut results = Vec::with_capacity(self.backends.len());
        for b in &self.backends {
            results.push((b.id().to_string(), b.probe().await));
        }
        results
    }
}
