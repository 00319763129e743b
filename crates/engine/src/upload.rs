//! Upload orchestrator: drives one file from chunking to `Completed`.
//!
//! Pipeline: split the source into chunk artifacts (one streaming pass),
//! assign each chunk a backend round-robin, persist the manifest with every
//! chunk `Pending`, then push chunks through a bounded worker pool. Chunk
//! statuses are written back to the manifest store as they change, so the
//! manifest is always the durable truth.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshard_backend::{BackendError, BackendRegistry};
use driveshard_chunker::{chunk_file_name, split_file};
use driveshard_manifest::{
    ChunkRecord, ChunkStatus, FileStatus, Manifest, ManifestError, ManifestStore, OriginalFile,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorClass, classify, classify_backend};
use crate::events::{TransferEvent, TransferStage};
use crate::retry::RetryPolicy;

pub struct UploadOrchestrator {
    config: EngineConfig,
    store: Arc<ManifestStore>,
    registry: Arc<BackendRegistry>,
    events_tx: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<ManifestStore>,
        registry: Arc<BackendRegistry>,
        events_tx: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            events_tx,
            cancel,
        }
    }

    /// Uploads a new file. Returns the manifest id.
    pub async fn upload(&self, path: &Path) -> Result<String, EngineError> {
        if self.registry.is_empty() {
            return Err(EngineError::NoBackends);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Second-granularity ids collide when the same file name is
        // uploaded twice within one second; suffix the later one.
        let base = Manifest::derive_id(&file_name, Utc::now().naive_utc());
        let mut id = base.clone();
        let mut n = 1u32;
        while self.store.exists(&id) {
            n += 1;
            id = format!("{base}_{n}");
        }

        self.emit_stage(&id, TransferStage::Chunking);
        let artifact_dir = self.config.temp_dir.join(&id);
        let split = {
            let src = path.to_path_buf();
            let dir = artifact_dir.clone();
            let chunk_size = self.config.chunk_size_bytes;
            tokio::task::spawn_blocking(move || split_file(&src, &dir, chunk_size))
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(e)))??
        };
        info!(
            file = %split.file_name,
            size = split.size_bytes,
            chunks = split.chunks.len(),
            "chunking complete"
        );

        // Round-robin placement: chunk i lands on backends[i mod N].
        self.registry.reset_cursor();
        let chunks: Vec<ChunkRecord> = split
            .chunks
            .iter()
            .map(|c| ChunkRecord {
                index: c.index,
                remote_name: self
                    .config
                    .remote_name(&chunk_file_name(&split.file_name, c.index)),
                size_bytes: c.size_bytes,
                content_hash: c.content_hash.clone(),
                backend_id: self.registry.next_backend(),
                status: ChunkStatus::Pending,
            })
            .collect();

        let manifest = Manifest::new(
            id.clone(),
            OriginalFile {
                file_name: split.file_name.clone(),
                original_path: path.to_string_lossy().into_owned(),
                size_bytes: split.size_bytes,
                whole_file_hash: split.whole_file_hash.clone(),
            },
            chunks,
        );
        // The full placement is durable before any chunk transfer starts.
        self.store.create(&manifest)?;

        self.run_transfer(&id, &artifact_dir).await?;
        Ok(id)
    }

    /// Resumes an interrupted upload: transfers only chunks not yet
    /// `Stored`, keeping their original placement.
    pub async fn resume(&self, manifest_id: &str) -> Result<(), EngineError> {
        if self.registry.is_empty() {
            return Err(EngineError::NoBackends);
        }
        let manifest = self.load(manifest_id)?;
        let artifact_dir = self.config.temp_dir.join(manifest_id);
        self.ensure_artifacts(&manifest, &artifact_dir).await?;
        self.run_transfer(manifest_id, &artifact_dir).await
    }

    /// Re-splits the source if any pending chunk's local artifact is gone,
    /// verifying the source still matches the manifest's whole-file hash.
    async fn ensure_artifacts(
        &self,
        manifest: &Manifest,
        artifact_dir: &Path,
    ) -> Result<(), EngineError> {
        let file_name = &manifest.original_file.file_name;
        let missing = manifest
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Stored)
            .any(|c| !artifact_dir.join(chunk_file_name(file_name, c.index)).exists());
        if !missing {
            return Ok(());
        }

        warn!(id = %manifest.id, "chunk artifacts missing, re-splitting source");
        let split = {
            let src = PathBuf::from(&manifest.original_file.original_path);
            let dir = artifact_dir.to_path_buf();
            // First chunk's size is the chunk size used at creation.
            let chunk_size = manifest.chunks[0].size_bytes;
            tokio::task::spawn_blocking(move || split_file(&src, &dir, chunk_size))
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(e)))??
        };
        if split.whole_file_hash != manifest.original_file.whole_file_hash {
            return Err(EngineError::Integrity {
                expected: manifest.original_file.whole_file_hash.clone(),
                actual: split.whole_file_hash,
            });
        }
        Ok(())
    }

    async fn run_transfer(&self, id: &str, artifact_dir: &Path) -> Result<(), EngineError> {
        self.store.update_status(id, FileStatus::Transferring)?;
        self.emit_stage(id, TransferStage::Transferring);

        let manifest = self.load(id)?;
        let result = self.transfer_chunks(&manifest, artifact_dir).await;

        match &result {
            Ok(()) => {
                self.store.update_status(id, FileStatus::Completed)?;
                self.supersede_older(id).await;
                self.emit_stage(id, TransferStage::Completed);
                let _ = std::fs::remove_dir_all(artifact_dir);
                info!(id, "upload completed");
            }
            Err(EngineError::Cancelled) => {
                // Already-stored chunks stay stored; nothing is rolled back.
                self.store.update_status(id, FileStatus::Cancelled)?;
                self.emit_stage(id, TransferStage::Cancelled);
                let _ = std::fs::remove_dir_all(artifact_dir);
                info!(id, "upload cancelled");
            }
            Err(e) if classify(e) == ErrorClass::RateLimit => {
                // Remaining chunks and artifacts stay put for the retry
                // batch; status remains Transferring.
                warn!(id, error = %e, "upload paused by rate limit");
            }
            Err(e) => {
                self.store.update_status(id, FileStatus::Failed)?;
                self.emit_stage(id, TransferStage::Failed);
                let _ = std::fs::remove_dir_all(artifact_dir);
                warn!(id, error = %e, "upload failed");
            }
        }
        result
    }

    async fn transfer_chunks(
        &self,
        manifest: &Manifest,
        artifact_dir: &Path,
    ) -> Result<(), EngineError> {
        let pending: Vec<ChunkRecord> = manifest
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Stored)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let total = manifest.total_chunks();
        let done = Arc::new(AtomicUsize::new(total - pending.len()));

        let (feed_tx, feed_rx) = mpsc::channel(pending.len());
        for chunk in pending.iter() {
            // Capacity equals the chunk count, so this never blocks.
            let _ = feed_tx.try_send(chunk.clone());
        }
        drop(feed_tx);
        let feed_rx = Arc::new(tokio::sync::Mutex::new(feed_rx));

        let ctx = Arc::new(WorkerCtx {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            events_tx: self.events_tx.clone(),
            user_cancel: self.cancel.clone(),
            pool_cancel: self.cancel.child_token(),
            policy: RetryPolicy {
                base_delay: self.config.retry_base_delay,
                max_attempts: self.config.max_retries,
            },
            file_id: manifest.id.clone(),
            file_name: manifest.original_file.file_name.clone(),
            artifact_dir: artifact_dir.to_path_buf(),
            total,
            done,
        });

        let workers = self.config.workers.clamp(1, pending.len());
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let ctx = Arc::clone(&ctx);
            let feed = Arc::clone(&feed_rx);
            handles.push(tokio::spawn(upload_worker(ctx, feed)));
        }

        let mut failure: Option<EngineError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => keep_worst(&mut failure, e),
                Err(e) => keep_worst(&mut failure, EngineError::Io(std::io::Error::other(e))),
            }
        }

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A completed upload supersedes earlier manifests carrying the same
    /// file name: their records are removed, along with any of their blobs
    /// the new placement no longer references. Shared remote names were
    /// already overwritten by the new upload. Best-effort; the fresh
    /// manifest is already durable either way.
    async fn supersede_older(&self, id: &str) {
        let Ok(current) = self.load(id) else { return };
        let all = match self.store.list_all() {
            Ok(all) => all,
            Err(e) => {
                warn!(id, error = %e, "listing manifests to supersede failed");
                return;
            }
        };
        let kept: HashSet<&str> = current
            .chunks
            .iter()
            .map(|c| c.remote_name.as_str())
            .collect();
        for old in all.iter().filter(|m| {
            m.id != current.id
                && m.original_file.file_name == current.original_file.file_name
                && m.created_at <= current.created_at
        }) {
            for chunk in &old.chunks {
                if kept.contains(chunk.remote_name.as_str()) {
                    continue;
                }
                let Ok(backend) = self.registry.resolve(&chunk.backend_id) else {
                    continue;
                };
                match backend.delete(&chunk.remote_name).await {
                    // Already gone is fine; the blob may never have landed.
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => warn!(
                        old_id = %old.id,
                        chunk = chunk.index,
                        error = %e,
                        "orphaned blob of superseded manifest not deleted"
                    ),
                }
            }
            match self.store.delete(&old.id) {
                Ok(()) => info!(old_id = %old.id, id, "superseded manifest removed"),
                Err(e) => {
                    warn!(old_id = %old.id, error = %e, "superseded manifest removal failed");
                }
            }
        }
    }

    fn load(&self, id: &str) -> Result<Manifest, EngineError> {
        self.store.get(id).map_err(|e| match e {
            ManifestError::NotFound(id) => EngineError::ManifestNotFound(id),
            other => other.into(),
        })
    }

    fn emit_stage(&self, file_id: &str, stage: TransferStage) {
        let _ = self.events_tx.try_send(TransferEvent::Stage {
            file_id: file_id.to_string(),
            stage,
        });
    }
}

/// Keeps the most actionable failure: terminal errors trump rate limits,
/// which trump everything else.
fn keep_worst(slot: &mut Option<EngineError>, new: EngineError) {
    let replace = match slot {
        None => true,
        Some(old) => match (classify(old), classify(&new)) {
            (ErrorClass::Terminal, _) => false,
            (_, ErrorClass::Terminal) => true,
            (ErrorClass::RateLimit, _) => false,
            (_, ErrorClass::RateLimit) => true,
            _ => false,
        },
    };
    if replace {
        *slot = Some(new);
    }
}

struct WorkerCtx {
    store: Arc<ManifestStore>,
    registry: Arc<BackendRegistry>,
    events_tx: mpsc::Sender<TransferEvent>,
    /// User-initiated cancellation: results of in-flight calls are discarded.
    user_cancel: CancellationToken,
    /// Pool-internal stop signal: also fires when a sibling worker fails.
    pool_cancel: CancellationToken,
    policy: RetryPolicy,
    file_id: String,
    file_name: String,
    artifact_dir: PathBuf,
    total: usize,
    done: Arc<AtomicUsize>,
}

async fn upload_worker(
    ctx: Arc<WorkerCtx>,
    feed: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkRecord>>>,
) -> Result<(), EngineError> {
    loop {
        let chunk = {
            let mut rx = feed.lock().await;
            rx.recv().await
        };
        let Some(chunk) = chunk else { break };

        // Cooperative cancellation check at the dispatch boundary.
        if ctx.pool_cancel.is_cancelled() {
            break;
        }

        if let Err(e) = upload_one_chunk(&ctx, &chunk).await {
            ctx.pool_cancel.cancel();
            return Err(e);
        }

        if ctx.user_cancel.is_cancelled() {
            break;
        }
    }
    Ok(())
}

async fn upload_one_chunk(ctx: &WorkerCtx, chunk: &ChunkRecord) -> Result<(), EngineError> {
    let backend = match ctx.registry.resolve(&chunk.backend_id) {
        Ok(b) => b,
        Err(e) => {
            ctx.store
                .update_chunk_status(&ctx.file_id, chunk.index, ChunkStatus::Failed)?;
            return Err(e.into());
        }
    };

    let artifact = ctx
        .artifact_dir
        .join(chunk_file_name(&ctx.file_name, chunk.index));
    ctx.store
        .update_chunk_status(&ctx.file_id, chunk.index, ChunkStatus::InFlight)?;

    let mut attempts = 0u32;
    let outcome = loop {
        match backend.store(&artifact, &chunk.remote_name).await {
            Ok(()) => break Ok(()),
            Err(e) => {
                attempts += 1;
                match classify_backend(&e) {
                    ErrorClass::Transient if ctx.policy.allows(attempts) => {
                        let delay = ctx.policy.delay_for(attempts - 1);
                        warn!(
                            file_id = %ctx.file_id,
                            chunk = chunk.index,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient store failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    ErrorClass::Transient => {
                        break Err(EngineError::RetriesExhausted {
                            file_id: ctx.file_id.clone(),
                            chunk_index: chunk.index,
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    _ => {
                        break Err(EngineError::Backend {
                            file_id: ctx.file_id.clone(),
                            chunk_index: chunk.index,
                            backend_id: chunk.backend_id.clone(),
                            source: e,
                        });
                    }
                }
            }
        }
    };

    match outcome {
        Ok(()) => {
            if ctx.user_cancel.is_cancelled() {
                // The store call raced the cancel flag; its result is
                // discarded and the chunk stays Pending. Chunks already
                // marked Stored are never rolled back.
                ctx.store
                    .update_chunk_status(&ctx.file_id, chunk.index, ChunkStatus::Pending)?;
                return Ok(());
            }
            ctx.store
                .update_chunk_status(&ctx.file_id, chunk.index, ChunkStatus::Stored)?;
            let _ = std::fs::remove_file(&artifact);
            let done = ctx.done.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(file_id = %ctx.file_id, chunk = chunk.index, done, total = ctx.total, "chunk stored");
            let _ = ctx.events_tx.try_send(TransferEvent::ChunkProgress {
                file_id: ctx.file_id.clone(),
                done,
                total: ctx.total,
            });
            Ok(())
        }
        Err(e) => {
            let status = if classify(&e) == ErrorClass::RateLimit {
                // The chunk itself is fine; it goes back in the retry batch.
                ChunkStatus::Pending
            } else {
                ChunkStatus::Failed
            };
            ctx.store
                .update_chunk_status(&ctx.file_id, chunk.index, status)?;
            Err(e)
        }
    }
}
