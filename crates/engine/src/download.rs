//! Download orchestrator: fetches a manifest's chunks and reassembles the
//! original file.
//!
//! Every chunk is verified against its recorded hash right after the fetch;
//! a mismatch is treated as transient (the remote copy may be corrupt or
//! half-written) and retried. The final merge re-verifies the whole-file
//! hash; a mismatch there is fatal. A download never mutates the manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshard_backend::BackendRegistry;
use driveshard_chunker::{ChunkerError, chunk_file_name, merge_chunks, verify_chunk};
use driveshard_manifest::{ChunkRecord, Manifest, ManifestError, ManifestStore};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorClass, classify_backend};
use crate::events::{TransferEvent, TransferStage};
use crate::retry::RetryPolicy;

pub struct DownloadOrchestrator {
    config: EngineConfig,
    store: Arc<ManifestStore>,
    registry: Arc<BackendRegistry>,
    events_tx: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl DownloadOrchestrator {
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

    /// Downloads and reconstructs the file described by `manifest_id` into
    /// `dest`.
    pub async fn download(&self, manifest_id: &str, dest: &Path) -> Result<(), EngineError> {
        let manifest = self.store.get(manifest_id).map_err(|e| match e {
            ManifestError::NotFound(id) => EngineError::ManifestNotFound(id),
            other => other.into(),
        })?;

        // Fail fast if any referenced backend is no longer configured,
        // before a single byte moves.
        for chunk in &manifest.chunks {
            self.registry.resolve(&chunk.backend_id)?;
        }

        let stage_dir = self.config.temp_dir.join(format!("download_{manifest_id}"));
        std::fs::create_dir_all(&stage_dir)?;

        let result = self.run(&manifest, &stage_dir, dest).await;

        // Staging artifacts are removed on every outcome; the destination
        // only survives a fully verified merge.
        let _ = std::fs::remove_dir_all(&stage_dir);
        match &result {
            Ok(()) => {
                self.emit_stage(manifest_id, TransferStage::Completed);
                info!(id = %manifest_id, dest = %dest.display(), "download completed");
            }
            Err(EngineError::Cancelled) => {
                remove_if_present(dest);
                self.emit_stage(manifest_id, TransferStage::Cancelled);
                info!(id = %manifest_id, "download cancelled");
            }
            Err(e) if crate::error::classify(e) == ErrorClass::RateLimit => {
                warn!(id = %manifest_id, error = %e, "download paused by rate limit");
            }
            Err(e) => {
                remove_if_present(dest);
                self.emit_stage(manifest_id, TransferStage::Failed);
                warn!(id = %manifest_id, error = %e, "download failed");
            }
        }
        result
    }

    async fn run(
        &self,
        manifest: &Manifest,
        stage_dir: &Path,
        dest: &Path,
    ) -> Result<(), EngineError> {
        self.emit_stage(&manifest.id, TransferStage::Transferring);
        self.fetch_chunks(manifest, stage_dir).await?;

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.emit_stage(&manifest.id, TransferStage::Merging);
        let ordered: Vec<PathBuf> = manifest
            .chunks
            .iter()
            .map(|c| stage_dir.join(chunk_file_name(&manifest.original_file.file_name, c.index)))
            .collect();
        let expected = manifest.original_file.whole_file_hash.clone();
        let dest_buf = dest.to_path_buf();
        let merged = tokio::task::spawn_blocking(move || {
            merge_chunks(&ordered, &dest_buf, &expected)
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

        self.emit_stage(&manifest.id, TransferStage::Verifying);
        match merged {
            Ok(_hash) => Ok(()),
            // Merge-time mismatch is a deeper inconsistency, not a blip.
            Err(ChunkerError::Integrity { expected, actual }) => {
                Err(EngineError::Integrity { expected, actual })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_chunks(&self, manifest: &Manifest, stage_dir: &Path) -> Result<(), EngineError> {
        let total = manifest.total_chunks();
        let done = Arc::new(AtomicUsize::new(0));

        let (feed_tx, feed_rx) = mpsc::channel(total.max(1));
        for chunk in &manifest.chunks {
            let _ = feed_tx.try_send(chunk.clone());
        }
        drop(feed_tx);
        let feed_rx = Arc::new(tokio::sync::Mutex::new(feed_rx));

        let ctx = Arc::new(FetchCtx {
            registry: Arc::clone(&self.registry),
            events_tx: self.events_tx.clone(),
            pool_cancel: self.cancel.child_token(),
            policy: RetryPolicy {
                base_delay: self.config.retry_base_delay,
                max_attempts: self.config.max_retries,
            },
            file_id: manifest.id.clone(),
            file_name: manifest.original_file.file_name.clone(),
            stage_dir: stage_dir.to_path_buf(),
            total,
            done,
        });

        let workers = self.config.workers.clamp(1, total);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let ctx = Arc::clone(&ctx);
            let feed = Arc::clone(&feed_rx);
            handles.push(tokio::spawn(fetch_worker(ctx, feed)));
        }

        let mut failure: Option<EngineError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(EngineError::Io(std::io::Error::other(e)));
                    }
                }
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

    fn emit_stage(&self, file_id: &str, stage: TransferStage) {
        let _ = self.events_tx.try_send(TransferEvent::Stage {
            file_id: file_id.to_string(),
            stage,
        });
    }
}

fn remove_if_present(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial download");
        }
    }
}

struct FetchCtx {
    registry: Arc<BackendRegistry>,
    events_tx: mpsc::Sender<TransferEvent>,
    pool_cancel: CancellationToken,
    policy: RetryPolicy,
    file_id: String,
    file_name: String,
    stage_dir: PathBuf,
    total: usize,
    done: Arc<AtomicUsize>,
}

async fn fetch_worker(
    ctx: Arc<FetchCtx>,
    feed: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkRecord>>>,
) -> Result<(), EngineError> {
    loop {
        let chunk = {
            let mut rx = feed.lock().await;
            rx.recv().await
        };
        let Some(chunk) = chunk else { break };

        if ctx.pool_cancel.is_cancelled() {
            break;
        }

        if let Err(e) = fetch_one_chunk(&ctx, &chunk).await {
            ctx.pool_cancel.cancel();
            return Err(e);
        }
    }
    Ok(())
}

async fn fetch_one_chunk(ctx: &FetchCtx, chunk: &ChunkRecord) -> Result<(), EngineError> {
    let backend = ctx.registry.resolve(&chunk.backend_id)?;
    let artifact = ctx
        .stage_dir
        .join(chunk_file_name(&ctx.file_name, chunk.index));

    let mut attempts = 0u32;
    loop {
        let failure: String = match backend.fetch(&chunk.remote_name, &artifact).await {
            Ok(()) => {
                // Verify immediately; a corrupt payload is retryable.
                match verify_chunk(&artifact, &chunk.content_hash) {
                    Ok(()) => {
                        let done = ctx.done.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            file_id = %ctx.file_id,
                            chunk = chunk.index,
                            done,
                            total = ctx.total,
                            "chunk fetched and verified"
                        );
                        let _ = ctx.events_tx.try_send(TransferEvent::ChunkProgress {
                            file_id: ctx.file_id.clone(),
                            done,
                            total: ctx.total,
                        });
                        return Ok(());
                    }
                    Err(ChunkerError::Integrity { expected, actual }) => {
                        let _ = std::fs::remove_file(&artifact);
                        format!("chunk hash mismatch: expected {expected}, got {actual}")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => match classify_backend(&e) {
                ErrorClass::Transient => e.to_string(),
                _ => {
                    return Err(EngineError::Backend {
                        file_id: ctx.file_id.clone(),
                        chunk_index: chunk.index,
                        backend_id: chunk.backend_id.clone(),
                        source: e,
                    });
                }
            },
        };

        attempts += 1;
        if !ctx.policy.allows(attempts) {
            return Err(EngineError::RetriesExhausted {
                file_id: ctx.file_id.clone(),
                chunk_index: chunk.index,
                attempts,
                last_error: failure,
            });
        }
        let delay = ctx.policy.delay_for(attempts - 1);
        warn!(
            file_id = %ctx.file_id,
            chunk = chunk.index,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "transient fetch failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailureScript, MockBackend, make_registry, upload_fixture};
    use crate::upload::UploadOrchestrator;
    use driveshard_backend::BackendError;
    use driveshard_chunker::hash_file;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> EngineConfig {
        let mut cfg = EngineConfig::new(dir.join("tmp"));
        cfg.chunk_size_bytes = 4;
        cfg.workers = 2;
        cfg.retry_base_delay = std::time::Duration::from_millis(1);
        cfg
    }

    async fn uploaded_file(
        dir: &Path,
        backends: Vec<Arc<MockBackend>>,
        data: &[u8],
    ) -> (Arc<ManifestStore>, Arc<BackendRegistry>, String) {
        let store = Arc::new(ManifestStore::open(dir.join("manifests")).unwrap());
        let registry = make_registry(backends);
        let (tx, _rx) = mpsc::channel(256);
        let orch = UploadOrchestrator::new(
            test_config(dir),
            Arc::clone(&store),
            Arc::clone(&registry),
            tx,
            CancellationToken::new(),
        );
        let id = upload_fixture(&orch, dir, data).await;
        (store, registry, id)
    }

    fn downloader(
        dir: &Path,
        store: Arc<ManifestStore>,
        registry: Arc<BackendRegistry>,
        cancel: CancellationToken,
    ) -> DownloadOrchestrator {
        let (tx, _rx) = mpsc::channel(256);
        DownloadOrchestrator::new(test_config(dir), store, registry, tx, cancel)
    }

    #[tokio::test]
    async fn download_reconstructs_original_bytes() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let b1 = MockBackend::healthy("b1");
        let data = b"the quick brown fox jumps over the lazy dog";
        let (store, registry, id) =
            uploaded_file(dir.path(), vec![b0, b1], data).await;

        let dest = dir.path().join("restored.bin");
        let orch = downloader(dir.path(), store, registry, CancellationToken::new());
        orch.download(&id, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn download_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ManifestStore::open(dir.path().join("manifests")).unwrap());
        let registry = make_registry(vec![MockBackend::healthy("b0")]);
        let orch = downloader(dir.path(), store, registry, CancellationToken::new());

        let err = orch
            .download("nope", &dir.path().join("out.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ManifestNotFound(_)));
    }

    #[tokio::test]
    async fn download_unknown_backend_fails_fast() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"0123456789";
        let (store, _registry, id) = uploaded_file(dir.path(), vec![Arc::clone(&b0)], data).await;

        // A registry where the placed backend no longer exists.
        let other = make_registry(vec![MockBackend::healthy("different")]);
        let orch = downloader(dir.path(), store, other, CancellationToken::new());

        let err = orch
            .download(&id, &dir.path().join("out.bin"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(driveshard_backend::RegistryError::UnknownBackend(_))
        ));
        // Not a single fetch was attempted.
        assert_eq!(b0.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn corrupt_payload_twice_then_good_succeeds() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"abcd"; // single chunk
        let (store, registry, id) = uploaded_file(dir.path(), vec![Arc::clone(&b0)], data).await;

        // First two fetches deliver corrupted bytes, third is clean.
        b0.corrupt_next_fetches(2);

        let dest = dir.path().join("restored.bin");
        let orch = downloader(dir.path(), store.clone(), registry, CancellationToken::new());
        orch.download(&id, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(b0.fetch_calls(), 3);
        // The manifest is never mutated by a download.
        let m = store.get(&id).unwrap();
        assert_eq!(m.status, driveshard_manifest::FileStatus::Completed);
    }

    #[tokio::test]
    async fn corrupt_payload_every_time_exhausts_retries() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"abcd";
        let (store, registry, id) = uploaded_file(dir.path(), vec![Arc::clone(&b0)], data).await;

        b0.corrupt_next_fetches(u32::MAX);

        let dest = dir.path().join("restored.bin");
        let orch = downloader(dir.path(), store, registry, CancellationToken::new());
        let err = orch.download(&id, &dest).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn transient_fetch_failures_recover() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"0123456789ab";
        let (store, registry, id) = uploaded_file(dir.path(), vec![Arc::clone(&b0)], data).await;

        b0.script_fetch(FailureScript::fail_n(2, || {
            BackendError::Transient("connection reset".into())
        }));

        let dest = dir.path().join("restored.bin");
        let orch = downloader(dir.path(), store, registry, CancellationToken::new());
        orch.download(&id, &dest).await.unwrap();
        assert_eq!(hash_file(&dest).unwrap(), hash_file(&dir.path().join("src.bin")).unwrap());
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_partial_output() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"0123456789abcdef0123";
        let (store, registry, id) = uploaded_file(dir.path(), vec![b0], data).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let dest = dir.path().join("restored.bin");
        let orch = downloader(dir.path(), store, registry, cancel);
        let err = orch.download(&id, &dest).await.unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(!dest.exists());
        // Staging directory cleaned up.
        assert!(!dir.path().join("tmp").join(format!("download_{id}")).exists());
    }

    #[tokio::test]
    async fn auth_error_on_fetch_is_terminal() {
        let dir = TempDir::new().unwrap();
        let b0 = MockBackend::healthy("b0");
        let data = b"abcd";
        let (store, registry, id) = uploaded_file(dir.path(), vec![Arc::clone(&b0)], data).await;

        b0.script_fetch(FailureScript::always(|| {
            BackendError::Auth("token expired".into())
        }));

        let orch = downloader(dir.path(), store, registry, CancellationToken::new());
        let err = orch
            .download(&id, &dir.path().join("out.bin"))
            .await
            .unwrap_err();
        assert_eq!(crate::error::classify(&err), ErrorClass::Terminal);
        assert_eq!(b0.fetch_calls(), 1);
    }
}
