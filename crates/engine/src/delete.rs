//! Remote deletion sweep for a stored file.
//!
//! The sweep visits every chunk and keeps going past individual failures,
//! so one unreachable backend does not strand blobs on the others. A blob
//! that is already gone counts as deleted; the sweep is idempotent and can
//! be re-run after partial failures.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driveshard_backend::{BackendError, BackendRegistry};
use driveshard_manifest::{ManifestError, ManifestStore};

use crate::error::EngineError;

/// Outcome of a deletion sweep.
#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub file_id: String,
    pub total: usize,
    pub deleted: usize,
    /// Chunk index and error message for each blob that could not be
    /// removed.
    pub failed: Vec<(usize, String)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Deleter {
    store: Arc<ManifestStore>,
    registry: Arc<BackendRegistry>,
    cancel: CancellationToken,
}

impl Deleter {
    pub fn new(
        store: Arc<ManifestStore>,
        registry: Arc<BackendRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            cancel,
        }
    }

    /// Deletes every chunk blob of `manifest_id`, then the manifest itself.
    ///
    /// The manifest record is only removed when every blob is confirmed
    /// gone; otherwise it stays so the sweep can be retried. Cancellation
    /// is checked between chunks; a cancelled sweep keeps the manifest.
    pub async fn delete(&self, manifest_id: &str) -> Result<DeleteReport, EngineError> {
        let manifest = self.store.get(manifest_id).map_err(|e| match e {
            ManifestError::NotFound(id) => EngineError::ManifestNotFound(id),
            other => other.into(),
        })?;

        let mut report = DeleteReport {
            file_id: manifest.id.clone(),
            total: manifest.total_chunks(),
            deleted: 0,
            failed: Vec::new(),
        };

        for chunk in &manifest.chunks {
            if self.cancel.is_cancelled() {
                info!(file_id = %manifest.id, "deletion sweep cancelled");
                return Err(EngineError::Cancelled);
            }
            let backend = match self.registry.resolve(&chunk.backend_id) {
                Ok(b) => b,
                Err(e) => {
                    report.failed.push((chunk.index, e.to_string()));
                    continue;
                }
            };
            match backend.delete(&chunk.remote_name).await {
                // Already gone is the goal state, not a failure.
                Ok(()) | Err(BackendError::NotFound(_)) => report.deleted += 1,
                Err(e) => {
                    warn!(
                        file_id = %manifest.id,
                        chunk = chunk.index,
                        backend = %chunk.backend_id,
                        error = %e,
                        "chunk blob deletion failed"
                    );
                    report.failed.push((chunk.index, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            self.store.delete(manifest_id)?;
            info!(file_id = %manifest_id, blobs = report.deleted, "file deleted");
        } else {
            warn!(
                file_id = %manifest_id,
                failed = report.failed.len(),
                "deletion sweep incomplete, manifest retained"
            );
        }
        Ok(report)
    }
}
