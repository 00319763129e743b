//! Test doubles shared by the engine test suites.
//!
//! `MockBackend` keeps blobs in memory and can be scripted to fail with
//! any backend error, corrupt fetched payloads, stall stores, or report
//! any probe health.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use driveshard_backend::{
    BackendError, BackendHealth, BackendRegistry, StorageBackend,
};

use crate::events::TransferEvent;
use crate::upload::UploadOrchestrator;

/// Produces a scripted error for the next `n` calls, then stops firing.
pub struct FailureScript {
    remaining: AtomicU32,
    make: Box<dyn Fn() -> BackendError + Send + Sync>,
}

impl FailureScript {
    pub fn fail_n(n: u32, make: impl Fn() -> BackendError + Send + Sync + 'static) -> Self {
        Self {
            remaining: AtomicU32::new(n),
            make: Box::new(make),
        }
    }

    pub fn always(make: impl Fn() -> BackendError + Send + Sync + 'static) -> Self {
        Self::fail_n(u32::MAX, make)
    }

    fn next(&self) -> Option<BackendError> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .ok()
            .map(|_| (self.make)())
    }
}

#[derive(Default)]
pub struct MockBackend {
    id: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    store_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    store_script: Mutex<Option<FailureScript>>,
    fetch_script: Mutex<Option<FailureScript>>,
    delete_script: Mutex<Option<FailureScript>>,
    /// Number of upcoming fetches whose payload gets corrupted.
    corrupt_fetches: AtomicU32,
    store_delay: Mutex<Option<Duration>>,
    health: Mutex<Option<BackendHealth>>,
}

impl MockBackend {
    pub fn healthy(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ..Self::default()
        })
    }

    pub fn script_store(&self, script: FailureScript) {
        *lock(&self.store_script) = Some(script);
    }

    pub fn clear_store_script(&self) {
        *lock(&self.store_script) = None;
    }

    pub fn script_fetch(&self, script: FailureScript) {
        *lock(&self.fetch_script) = Some(script);
    }

    pub fn clear_fetch_script(&self) {
        *lock(&self.fetch_script) = None;
    }

    pub fn script_delete(&self, script: FailureScript) {
        *lock(&self.delete_script) = Some(script);
    }

    pub fn clear_delete_script(&self) {
        *lock(&self.delete_script) = None;
    }

    pub fn corrupt_next_fetches(&self, n: u32) {
        self.corrupt_fetches.store(n, Ordering::SeqCst);
    }

    pub fn delay_stores(&self, delay: Duration) {
        *lock(&self.store_delay) = Some(delay);
    }

    pub fn set_health(&self, health: BackendHealth) {
        *lock(&self.health) = Some(health);
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Remote names currently held, unordered.
    pub fn stored_blobs(&self) -> Vec<String> {
        lock(&self.blobs).keys().cloned().collect()
    }

    pub fn clear_blobs(&self) {
        lock(&self.blobs).clear();
    }
}

impl StorageBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn store(
        &self,
        local: &Path,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let local: PathBuf = local.to_path_buf();
        let remote = remote_name.to_string();
        Box::pin(async move {
            let delay = *lock(&self.store_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.store_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = lock(&self.store_script).as_ref().and_then(FailureScript::next) {
                return Err(err);
            }
            let bytes = std::fs::read(&local)?;
            lock(&self.blobs).insert(remote, bytes);
            Ok(())
        })
    }

    fn fetch(
        &self,
        remote_name: &str,
        local: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let remote = remote_name.to_string();
        let local: PathBuf = local.to_path_buf();
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = lock(&self.fetch_script).as_ref().and_then(FailureScript::next) {
                return Err(err);
            }
            let mut bytes = lock(&self.blobs)
                .get(&remote)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(remote.clone()))?;
            let corrupt = self
                .corrupt_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if corrupt {
                for b in &mut bytes {
                    *b ^= 0xff;
                }
            }
            std::fs::write(&local, bytes)?;
            Ok(())
        })
    }

    fn delete(
        &self,
        remote_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        let remote = remote_name.to_string();
        Box::pin(async move {
            if let Some(err) = lock(&self.delete_script).as_ref().and_then(FailureScript::next) {
                return Err(err);
            }
            match lock(&self.blobs).remove(&remote) {
                Some(_) => Ok(()),
                None => Err(BackendError::NotFound(remote)),
            }
        })
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = BackendHealth> + Send + '_>> {
        Box::pin(async move { lock(&self.health).unwrap_or(BackendHealth::Healthy) })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn make_registry(backends: Vec<Arc<MockBackend>>) -> Arc<BackendRegistry> {
    let handles = backends
        .into_iter()
        .map(|b| b as Arc<dyn StorageBackend>)
        .collect();
    Arc::new(BackendRegistry::new(handles).unwrap())
}

/// Drains every event already sitting in the channel, without waiting.
pub fn collect_events(mut rx: mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Writes `data` to `dir/src.bin` and uploads it, returning the manifest
/// id.
pub async fn upload_fixture(orch: &UploadOrchestrator, dir: &Path, data: &[u8]) -> String {
    let src = dir.join("src.bin");
    std::fs::write(&src, data).unwrap();
    orch.upload(&src).await.unwrap()
}
