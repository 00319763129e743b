//! JSON-file-per-manifest store with per-id write serialization.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{ChunkStatus, FileStatus, Manifest, ManifestError};

/// Durable store for [`Manifest`] records.
///
/// One `{id}.json` file per manifest under the store directory. Mutations
/// are read-modify-write under a per-id mutex, so concurrent chunk workers
/// updating the *same* manifest are serialized while writers to different
/// manifests never contend. Every write goes through a temp file and an
/// atomic rename, so a crash never leaves a half-written record behind.
pub struct ManifestStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ManifestStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a new manifest. Fails if the id already exists.
    pub fn create(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let guard = self.lock_for(&manifest.id);
        let _guard = guard.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.manifest_path(&manifest.id);
        if path.exists() {
            return Err(ManifestError::AlreadyExists(manifest.id.clone()));
        }
        self.write_record(manifest)?;
        debug!(id = %manifest.id, chunks = manifest.chunks.len(), "manifest created");
        Ok(())
    }

    /// `true` if a manifest with this id is on disk.
    pub fn exists(&self, id: &str) -> bool {
        self.manifest_path(id).exists()
    }

    /// Loads a manifest by id.
    pub fn get(&self, id: &str) -> Result<Manifest, ManifestError> {
        let path = self.manifest_path(id);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Loads every manifest, newest first.
    ///
    /// Unreadable or malformed entries are skipped with a warning rather
    /// than failing the whole listing.
    pub fn list_all(&self) -> Result<Vec<Manifest>, ManifestError> {
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(ManifestError::from).and_then(|d| {
                serde_json::from_slice::<Manifest>(&d).map_err(ManifestError::from)
            }) {
                Ok(m) => manifests.push(m),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                }
            }
        }
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }

    /// Manifests whose upload completed — the set offered for download.
    pub fn list_completed(&self) -> Result<Vec<Manifest>, ManifestError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|m| m.status == FileStatus::Completed)
            .collect())
    }

    /// Updates one chunk's status. Durable before return.
    pub fn update_chunk_status(
        &self,
        id: &str,
        index: usize,
        status: ChunkStatus,
    ) -> Result<(), ManifestError> {
        self.mutate(id, |m| {
            let total = m.chunks.len();
            let chunk = m
                .chunks
                .get_mut(index)
                .ok_or_else(|| ManifestError::ChunkIndexOutOfRange {
                    id: id.to_string(),
                    index,
                    total,
                })?;
            chunk.status = status;
            Ok(())
        })
    }

    /// Updates the overall file status. Durable before return.
    pub fn update_status(&self, id: &str, status: FileStatus) -> Result<(), ManifestError> {
        self.mutate(id, |m| {
            m.status = status;
            Ok(())
        })
    }

    /// Removes a manifest record.
    ///
    /// The caller is responsible for having attempted remote chunk deletion
    /// first; this only drops the local record.
    pub fn delete(&self, id: &str) -> Result<(), ManifestError> {
        let guard = self.lock_for(id);
        let _guard = guard.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.manifest_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "manifest deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ManifestError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut Manifest) -> Result<(), ManifestError>,
    ) -> Result<(), ManifestError> {
        let guard = self.lock_for(id);
        let _guard = guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = self.get(id)?;
        f(&mut manifest)?;
        manifest.updated_at = Utc::now();
        self.write_record(&manifest)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Temp-file + rename so a crash mid-write never corrupts the record.
    fn write_record(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let path = self.manifest_path(&manifest.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(manifest)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}
