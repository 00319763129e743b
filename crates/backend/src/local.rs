//! Filesystem-backed storage backend.
//!
//! Stores blobs as plain files under a root directory. Serves local or
//! mounted targets directly and doubles as the reference implementation of
//! the [`StorageBackend`] capability.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use crate::{BackendError, BackendHealth, StorageBackend};

pub struct LocalDirBackend {
    id: String,
    root: PathBuf,
}

impl LocalDirBackend {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    fn blob_path(&self, remote_name: &str) -> PathBuf {
        // Remote names may carry a folder prefix ("driveshard/x.chunk");
        // keep that structure under the root.
        self.root.join(remote_name)
    }
}

impl StorageBackend for LocalDirBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn store(
        &self,
        local: &Path,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let local = local.to_path_buf();
        let dest = self.blob_path(remote_name);
        Box::pin(async move {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&local, &dest).await?;
            debug!(backend = %self.id, blob = %dest.display(), "stored blob");
            Ok(())
        })
    }

    fn fetch(
        &self,
        remote_name: &str,
        local: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let src = self.blob_path(remote_name);
        let local = local.to_path_buf();
        let name = remote_name.to_string();
        Box::pin(async move {
            if !tokio::fs::try_exists(&src).await? {
                return Err(BackendError::NotFound(name));
            }
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &local).await?;
            Ok(())
        })
    }

    fn delete(
        &self,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let path = self.blob_path(remote_name);
        let name = remote_name.to_string();
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(backend = %self.id, blob = %name, "deleted blob");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(BackendError::NotFound(name))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = BackendHealth> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::create_dir_all(&self.root).await {
                Ok(()) => BackendHealth::Healthy,
                Err(_) => BackendHealth::Unreachable,
            }
        })
    }
}
