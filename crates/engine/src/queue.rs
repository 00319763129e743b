//! Transfer queue: single active job, FIFO order, rate-limit batching.
//!
//! One coordinator task owns job execution. At most one job runs at a
//! time; everything else waits in FIFO order. When the active job hits a
//! rate limit, the whole batch (the interrupted job plus every queued job)
//! is parked and the queue pauses until the configured resume time, after
//! which the batch re-enqueues in its original order. Cancellation cancels
//! the active job's token and drops everything still queued.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshard_backend::{BackendError, BackendHealth, BackendRegistry};
use driveshard_manifest::ManifestStore;

use crate::config::EngineConfig;
use crate::delete::Deleter;
use crate::download::DownloadOrchestrator;
use crate::error::{EngineError, ErrorClass, classify};
use crate::events::{JobId, JobInfo, QueueSnapshot, TransferEvent};
use crate::retry::RetryEntry;
use crate::upload::UploadOrchestrator;

/// One unit of queued work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
}

#[derive(Debug, Clone)]
pub enum JobKind {
    Upload { source: PathBuf },
    /// Continuation of an interrupted upload: transfers only chunks not
    /// yet stored.
    ResumeUpload { manifest_id: String },
    Download { manifest_id: String, dest: PathBuf },
    Delete { manifest_id: String },
}

impl Job {
    fn new(kind: JobKind) -> Self {
        Self {
            id: JobId::new_v4(),
            kind,
        }
    }

    fn info(&self) -> JobInfo {
        let description = match &self.kind {
            JobKind::Upload { source } => format!("upload {}", source.display()),
            JobKind::ResumeUpload { manifest_id } => format!("resume upload {manifest_id}"),
            JobKind::Download { manifest_id, .. } => format!("download {manifest_id}"),
            JobKind::Delete { manifest_id } => format!("delete {manifest_id}"),
        };
        JobInfo {
            id: self.id,
            description,
        }
    }

    fn needs_preflight(&self) -> bool {
        matches!(
            self.kind,
            JobKind::Upload { .. } | JobKind::ResumeUpload { .. }
        )
    }
}

struct ActiveEntry {
    info: JobInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Job>,
    active: Option<ActiveEntry>,
    /// Batch parked by a rate limit, in its original queue order. The
    /// entries' `not_before` instants drive the coordinator's sleep;
    /// `paused_until` is the wall-clock twin reported to consumers.
    awaiting_retry: Vec<RetryEntry>,
    paused_until: Option<DateTime<Utc>>,
    /// Set by `cancel_active` so a cancelled job is reported as cancelled
    /// even if it happens to finish cleanly first.
    cancel_requested: bool,
}

struct QueueInner {
    config: EngineConfig,
    store: Arc<ManifestStore>,
    registry: Arc<BackendRegistry>,
    events_tx: mpsc::Sender<TransferEvent>,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// Handle to the transfer queue. Cloning is cheap; all clones share the
/// same queue. Dropping the last handle shuts the coordinator down.
pub struct TransferQueue {
    inner: Arc<QueueInner>,
    events_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
}

impl TransferQueue {
    pub fn new(
        config: EngineConfig,
        store: Arc<ManifestStore>,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let inner = Arc::new(QueueInner {
            config,
            store,
            registry,
            events_tx,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(coordinator(Arc::clone(&inner)));
        Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn enqueue_upload(&self, source: impl Into<PathBuf>) -> JobId {
        self.enqueue(Job::new(JobKind::Upload {
            source: source.into(),
        }))
    }

    pub fn enqueue_download(&self, manifest_id: &str, dest: impl Into<PathBuf>) -> JobId {
        self.enqueue(Job::new(JobKind::Download {
            manifest_id: manifest_id.to_string(),
            dest: dest.into(),
        }))
    }

    pub fn enqueue_delete(&self, manifest_id: &str) -> JobId {
        self.enqueue(Job::new(JobKind::Delete {
            manifest_id: manifest_id.to_string(),
        }))
    }

    fn enqueue(&self, job: Job) -> JobId {
        let id = job.id;
        {
            let mut st = self.inner.lock_state();
            info!(job_id = %id, job = %job.info().description, "job enqueued");
            st.queued.push_back(job);
            self.inner.publish_snapshot(&st);
        }
        self.inner.wake.notify_one();
        id
    }

    /// Cancels the active job and drops everything still queued.
    ///
    /// Already-stored chunks of the active job are kept; cancellation only
    /// stops further work.
    pub fn cancel_active(&self) {
        let mut st = self.inner.lock_state();
        st.queued.clear();
        st.awaiting_retry.clear();
        st.paused_until = None;
        if let Some(active) = &st.active {
            info!(job_id = %active.info.id, "cancelling active job");
            active.cancel.cancel();
            st.cancel_requested = true;
        }
        self.inner.publish_snapshot(&st);
        self.inner.wake.notify_one();
    }

    /// Removes a not-yet-started job. Returns `false` if it is unknown or
    /// already active.
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut st = self.inner.lock_state();
        let before = st.queued.len() + st.awaiting_retry.len();
        st.queued.retain(|j| j.id != job_id);
        st.awaiting_retry.retain(|e| e.job.id != job_id);
        if st.awaiting_retry.is_empty() {
            st.paused_until = None;
        }
        let removed = st.queued.len() + st.awaiting_retry.len() < before;
        if removed {
            self.inner.publish_snapshot(&st);
            self.inner.wake.notify_one();
        }
        removed
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.snapshot(&self.inner.lock_state())
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl QueueInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, st: &QueueState) -> QueueSnapshot {
        QueueSnapshot {
            active: st.active.as_ref().map(|a| a.info.clone()),
            queued: st.queued.iter().map(Job::info).collect(),
            awaiting_retry: st.awaiting_retry.iter().map(|e| e.job.info()).collect(),
            paused_until: st.paused_until,
        }
    }

    fn publish_snapshot(&self, st: &QueueState) {
        let _ = self
            .events_tx
            .try_send(TransferEvent::Snapshot(self.snapshot(st)));
    }

    async fn run_job(&self, job: &Job, cancel: CancellationToken) -> Result<String, EngineError> {
        if job.needs_preflight() {
            self.preflight().await?;
        }
        match &job.kind {
            JobKind::Upload { source } => {
                let orch = self.upload_orchestrator(cancel);
                orch.upload(source).await
            }
            JobKind::ResumeUpload { manifest_id } => {
                let orch = self.upload_orchestrator(cancel);
                orch.resume(manifest_id).await?;
                Ok(manifest_id.clone())
            }
            JobKind::Download { manifest_id, dest } => {
                let orch = DownloadOrchestrator::new(
                    self.config.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    self.events_tx.clone(),
                    cancel,
                );
                orch.download(manifest_id, dest).await?;
                Ok(manifest_id.clone())
            }
            JobKind::Delete { manifest_id } => {
                let deleter =
                    Deleter::new(Arc::clone(&self.store), Arc::clone(&self.registry), cancel);
                let report = deleter.delete(manifest_id).await?;
                if !report.is_clean() {
                    let (index, message) = report.failed[0].clone();
                    return Err(EngineError::RetriesExhausted {
                        file_id: report.file_id,
                        chunk_index: index,
                        attempts: 1,
                        last_error: message,
                    });
                }
                Ok(report.file_id)
            }
        }
    }

    fn upload_orchestrator(&self, cancel: CancellationToken) -> UploadOrchestrator {
        UploadOrchestrator::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.events_tx.clone(),
            cancel,
        )
    }

    /// Probes every backend before an upload starts so a dead account
    /// fails the job up front instead of mid-transfer.
    async fn preflight(&self) -> Result<(), EngineError> {
        for (id, health) in self.registry.probe_all().await {
            match health {
                BackendHealth::AuthError => {
                    return Err(EngineError::Preflight {
                        backend_id: id,
                        source: BackendError::Auth("probe rejected".into()),
                    });
                }
                BackendHealth::RateLimited => {
                    return Err(EngineError::Preflight {
                        backend_id: id,
                        source: BackendError::RateLimited("probe throttled".into()),
                    });
                }
                // An unreachable backend may recover by the time its first
                // chunk goes out; let the per-chunk retries handle it.
                BackendHealth::Healthy | BackendHealth::Unreachable => {}
            }
        }
        Ok(())
    }

    /// Decides how a job failure is handled. Exhausted transient retries
    /// are ambiguous: some providers throttle with generic errors, so if a
    /// probe now reports throttling the failure is upgraded to a
    /// rate-limit pause instead of a terminal job failure.
    async fn resolve_class(&self, err: &EngineError) -> ErrorClass {
        let class = classify(err);
        if class == ErrorClass::Terminal
            && matches!(err, EngineError::RetriesExhausted { .. })
            && self
                .registry
                .probe_all()
                .await
                .iter()
                .any(|(_, h)| *h == BackendHealth::RateLimited)
        {
            return ErrorClass::RateLimit;
        }
        class
    }

    fn finish_job(&self, job: Job, result: Result<String, EngineError>, class: Option<ErrorClass>) {
        let mut st = self.lock_state();
        st.active = None;
        let was_cancelled = std::mem::take(&mut st.cancel_requested);

        match result {
            Ok(file_id) => {
                // A job that raced the cancel flag and completed anyway is
                // still reported as completed; finished work is never
                // rolled back.
                if !was_cancelled {
                    info!(job_id = %job.id, file_id = %file_id, "job completed");
                }
                let _ = self.events_tx.try_send(TransferEvent::JobCompleted {
                    job_id: job.id,
                    file_id,
                });
            }
            Err(EngineError::Cancelled) => {
                let _ = self
                    .events_tx
                    .try_send(TransferEvent::JobCancelled { job_id: job.id });
            }
            Err(e) => match class.unwrap_or(ErrorClass::Terminal) {
                ErrorClass::RateLimit => self.park_batch(&mut st, job, &e),
                _ => {
                    warn!(job_id = %job.id, error = %e, "job failed");
                    let _ = self.events_tx.try_send(TransferEvent::JobFailed {
                        job_id: job.id,
                        file_id: error_file_id(&e),
                        error: e.to_string(),
                    });
                }
            },
        }
        self.publish_snapshot(&st);
    }

    /// Parks the interrupted job plus everything queued behind it, and
    /// pauses the queue for the configured rate-limit window.
    fn park_batch(&self, st: &mut QueueState, job: Job, err: &EngineError) {
        let resume_at = Instant::now() + self.config.rate_limit_pause;
        let resume_wall = Utc::now()
            + chrono::Duration::from_std(self.config.rate_limit_pause)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let attempts = st
            .awaiting_retry
            .iter()
            .find(|e| e.job.id == job.id)
            .map(|e| e.attempts)
            .unwrap_or(0)
            + 1;
        st.awaiting_retry.retain(|e| e.job.id != job.id);

        let mut batch = vec![RetryEntry {
            job: retarget(job, err, &self.store),
            attempts,
            last_error: ErrorClass::RateLimit,
            not_before: resume_at,
        }];
        for queued in st.queued.drain(..) {
            batch.push(RetryEntry {
                job: queued,
                attempts: 0,
                last_error: ErrorClass::RateLimit,
                not_before: resume_at,
            });
        }
        warn!(
            batch = batch.len(),
            pause_secs = self.config.rate_limit_pause.as_secs(),
            "rate limited, parking batch"
        );
        st.awaiting_retry = batch;
        st.paused_until = Some(resume_wall);
        let _ = self.events_tx.try_send(TransferEvent::QueuePaused {
            resume_at: resume_wall,
        });
    }
}

fn error_file_id(err: &EngineError) -> Option<String> {
    match err {
        EngineError::Backend { file_id, .. } | EngineError::RetriesExhausted { file_id, .. } => {
            Some(file_id.clone())
        }
        EngineError::ManifestNotFound(id) => Some(id.clone()),
        _ => None,
    }
}

/// Converts a rate-limited fresh upload into a resume job, so already
/// stored chunks are not re-sent when the batch wakes up.
fn retarget(job: Job, err: &EngineError, store: &ManifestStore) -> Job {
    if let JobKind::Upload { .. } = &job.kind {
        if let Some(file_id) = error_file_id(err) {
            if store.get(&file_id).is_ok() {
                return Job {
                    id: job.id,
                    kind: JobKind::ResumeUpload {
                        manifest_id: file_id,
                    },
                };
            }
        }
    }
    job
}

async fn coordinator(inner: Arc<QueueInner>) {
    loop {
        enum Next {
            Run(Job, CancellationToken),
            Sleep(Instant),
            Idle,
        }

        let next = {
            let mut st = inner.lock_state();
            let resume_at = st.awaiting_retry.iter().map(|e| e.not_before).max();
            if let Some(resume_at) = resume_at {
                if Instant::now() >= resume_at {
                    // Pause over: the batch goes back to the queue front in
                    // its original order.
                    let batch: Vec<RetryEntry> = st.awaiting_retry.drain(..).collect();
                    for entry in batch.into_iter().rev() {
                        debug!(
                            job = %entry.job.info().description,
                            attempts = entry.attempts,
                            class = ?entry.last_error,
                            "re-enqueueing parked job"
                        );
                        st.queued.push_front(entry.job);
                    }
                    st.paused_until = None;
                    inner.publish_snapshot(&st);
                    Next::Idle
                } else {
                    Next::Sleep(resume_at)
                }
            } else if st.active.is_none() {
                match st.queued.pop_front() {
                    Some(job) => {
                        let cancel = inner.shutdown.child_token();
                        st.active = Some(ActiveEntry {
                            info: job.info(),
                            cancel: cancel.clone(),
                        });
                        inner.publish_snapshot(&st);
                        Next::Run(job, cancel)
                    }
                    None => Next::Idle,
                }
            } else {
                Next::Idle
            }
        };

        match next {
            Next::Run(job, cancel) => {
                let result = inner.run_job(&job, cancel).await;
                let class = match &result {
                    Err(e) if !matches!(e, EngineError::Cancelled) => {
                        Some(inner.resolve_class(e).await)
                    }
                    _ => None,
                };
                inner.finish_job(job, result, class);
            }
            Next::Sleep(until) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {}
                    _ = inner.wake.notified() => {}
                    _ = inner.shutdown.cancelled() => return,
                }
            }
            Next::Idle => {
                // Loop back immediately if a batch was just re-enqueued;
                // otherwise wait for the next enqueue or shutdown.
                let has_work = {
                    let st = inner.lock_state();
                    st.active.is_none() && !st.queued.is_empty()
                };
                if !has_work {
                    tokio::select! {
                        _ = inner.wake.notified() => {}
                        _ = inner.shutdown.cancelled() => return,
                    }
                }
            }
        }
    }
}
