//! src/services/upload_pool.rs
//!
//! UploadPool: a fixed set of workers draining one shared queue of upload
//! tasks.
//!
//! - A local path is claimed when its task is queued and released only when
//!   the task reaches a terminal status, so one path never has two uploads
//!   in flight.
//! - Transient failures are requeued after an exponential backoff without
//!   holding a worker; permanent failures end the task at once.
//! - Each success is reconciled against the history store exactly once and
//!   then handed to the share aggregator exactly once.

use crate::{
    models::{
        remote::RemoteFile,
        task::{CompletedUpload, TaskStatus, UploadTask},
    },
    services::{
        history_service::{Reconcile, ReconcileOutcome},
        path_mapper::{MapError, RuleStore},
        remote_client::{RemoteError, RemoteStorage},
    },
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Upper bound for a single upload attempt.
    pub attempt_timeout: Duration,
    /// Credential rejections tolerated per task before giving up.
    pub auth_retry_limit: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30 * 60),
            auth_retry_limit: 2,
        }
    }
}

impl PoolSettings {
    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No path rule covers the file; fix the mappings.
    Unmapped,
    /// The provider or the filesystem refused the upload outright.
    Permanent,
    /// Transient failures used up every attempt.
    Exhausted,
    /// The session credential keeps being rejected; refresh it.
    AuthExpired,
    /// The worker panicked while handling the task.
    Crashed,
}

/// Last known failure for a path, kept for operators.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub task_id: Uuid,
    pub local_path: PathBuf,
    pub remote_path: Option<String>,
    pub kind: FailureKind,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued(Uuid),
    /// The path already has a task queued or in flight.
    Duplicate,
    /// The pool is shutting down.
    Closed,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    duplicates: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failures: Mutex<HashMap<PathBuf, FailureRecord>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub duplicates: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub failures: Vec<FailureRecord>,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        let mut failures: Vec<FailureRecord> = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        failures.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        PoolStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            failures,
        }
    }
}

/// Decrements the in-flight gauge even if the upload future panics.
struct InFlightGuard<'a>(&'a PoolStats);

impl<'a> InFlightGuard<'a> {
    fn enter(stats: &'a PoolStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collaborators the workers call into.
pub struct PoolDeps {
    pub rules: RuleStore,
    pub remote: Arc<dyn RemoteStorage>,
    pub history: Arc<dyn Reconcile>,
    /// Where succeeded uploads go for sharing; `None` when sharing is off.
    pub completions: Option<mpsc::UnboundedSender<CompletedUpload>>,
}

struct Shared {
    settings: PoolSettings,
    sender: mpsc::UnboundedSender<UploadTask>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<UploadTask>>,
    claims: Mutex<HashSet<PathBuf>>,
    settled: Notify,
    deps: PoolDeps,
    stats: PoolStats,
    shutdown: CancellationToken,
}

/// Cloneable entry point used by the intake and the HTTP handlers.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Queue a task unless its path is already claimed. Never blocks.
    pub fn submit(&self, task: UploadTask) -> SubmitOutcome {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return SubmitOutcome::Closed;
        }

        if !shared.claims().insert(task.local_path.clone()) {
            shared.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(path = %task.local_path.display(), "upload already pending for path");
            return SubmitOutcome::Duplicate;
        }

        let id = task.id;
        if let Err(mpsc::error::SendError(task)) = shared.sender.send(task) {
            shared.release(&task.local_path);
            return SubmitOutcome::Closed;
        }
        shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Queued(id)
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.shared.claims().contains(path)
    }

    pub fn pending(&self) -> usize {
        self.shared.claims().len()
    }

    /// Resolve once every submitted task reached a terminal status.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.settled.notified();
            if self.shared.claims().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// The running worker pool.
pub struct UploadPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
}

impl UploadPool {
    /// Spawn `settings.workers` workers on the current runtime.
    pub fn start(settings: PoolSettings, deps: PoolDeps, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker_count = settings.workers.max(1);
        let shared = Arc::new(Shared {
            settings,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            claims: Mutex::new(HashSet::new()),
            settled: Notify::new(),
            deps,
            stats: PoolStats::default(),
            shutdown,
        });

        let workers = (0..worker_count)
            .map(|worker| tokio::spawn(run_worker(worker, shared.clone())))
            .collect();
        info!(workers = worker_count, "upload workers started");

        Self {
            handle: PoolHandle { shared },
            workers,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Stop taking work, let in-flight uploads finish and join the workers.
    /// Queued tasks are dropped.
    pub async fn shutdown(self) {
        let shared = &self.handle.shared;
        shared.shutdown.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!("upload worker ended abnormally: {}", err);
            }
        }

        // Close the queue so late submits and retries bounce, then release
        // whatever never reached a worker.
        let mut dropped = 0usize;
        {
            let mut receiver = shared.receiver.lock().await;
            receiver.close();
            while let Ok(task) = receiver.try_recv() {
                warn!(path = %task.local_path.display(), "queued upload dropped at shutdown");
                shared.release(&task.local_path);
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "upload pool stopped with unfinished tasks");
        }
        info!("upload workers stopped");
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>) {
    debug!(worker, "upload worker ready");
    loop {
        let next = {
            let mut receiver = shared.receiver.lock().await;
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                task = receiver.recv() => task,
            }
        };
        let Some(task) = next else { break };

        let path = task.local_path.clone();
        let task_id = task.id;
        let attempts = task.attempts + 1;
        let outcome = AssertUnwindSafe(shared.process(task)).catch_unwind().await;
        if outcome.is_err() {
            error!(worker, path = %path.display(), "upload task panicked");
            shared.record_failure(FailureRecord {
                task_id,
                local_path: path.clone(),
                remote_path: None,
                kind: FailureKind::Crashed,
                attempts,
                last_error: "worker panicked".into(),
                failed_at: Utc::now(),
            });
            shared.release(&path);
        }
    }
    debug!(worker, "upload worker exiting");
}

impl Shared {
    fn claims(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, path: &Path) {
        self.claims().remove(path);
        self.settled.notify_waiters();
    }

    async fn process(self: &Arc<Self>, mut task: UploadTask) {
        task.status = TaskStatus::InFlight;
        task.attempts += 1;

        let remote_path = match &task.remote_path {
            Some(path) => path.clone(),
            None => match self.deps.rules.snapshot().map(&task.local_path) {
                Ok(path) => {
                    task.remote_path = Some(path.clone());
                    path
                }
                Err(err) => {
                    let kind = match err {
                        MapError::Unmapped(_) => FailureKind::Unmapped,
                        MapError::NotNormalized(_) => FailureKind::Permanent,
                    };
                    self.fail(task, kind, err.to_string());
                    return;
                }
            },
        };

        debug!(
            path = %task.local_path.display(),
            remote = %remote_path,
            attempt = task.attempts,
            "uploading"
        );
        let result = {
            let _in_flight = InFlightGuard::enter(&self.stats);
            tokio::time::timeout(
                self.settings.attempt_timeout,
                self.deps.remote.upload(&task.local_path, &remote_path),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout))
        };

        match result {
            Ok(file) => self.complete(task, file).await,
            Err(err) => self.handle_failure(task, err),
        }
    }

    async fn complete(&self, mut task: UploadTask, file: RemoteFile) {
        task.status = TaskStatus::Succeeded;
        info!(
            path = %task.local_path.display(),
            remote = %file.remote_path,
            attempts = task.attempts,
            deduplicated = file.deduplicated,
            "upload complete"
        );
        task.remote_file = Some(file);

        match self.deps.history.reconcile(&task).await {
            Ok(ReconcileOutcome::Updated) | Ok(ReconcileOutcome::AlreadyReconciled) => {}
            Ok(ReconcileOutcome::NotFound) => {
                warn!(path = %task.local_path.display(), "uploaded but host history has no record");
            }
            Ok(ReconcileOutcome::Conflict { current }) => {
                warn!(
                    path = %task.local_path.display(),
                    current = %current,
                    "uploaded but history record was not in the local state"
                );
            }
            Err(err) => {
                warn!(path = %task.local_path.display(), "history reconcile failed: {}", err);
            }
        }

        if let (Some(completions), Some(done)) = (&self.deps.completions, task.completion()) {
            if completions.send(done).is_err() {
                debug!("share aggregator is gone; completion not shared");
            }
        }

        // Counted only once the handoff is done; a panic above counts as crashed.
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task.local_path);
        self.release(&task.local_path);
    }

    fn handle_failure(self: &Arc<Self>, mut task: UploadTask, err: RemoteError) {
        if err.is_auth() {
            task.auth_failures += 1;
            if task.auth_failures >= self.settings.auth_retry_limit {
                self.fail(task, FailureKind::AuthExpired, err.to_string());
                return;
            }
        }

        if !err.is_transient() {
            self.fail(task, FailureKind::Permanent, err.to_string());
        } else if task.attempts >= self.settings.max_attempts {
            self.fail(task, FailureKind::Exhausted, err.to_string());
        } else {
            self.schedule_retry(task, err);
        }
    }

    fn schedule_retry(self: &Arc<Self>, mut task: UploadTask, err: RemoteError) {
        let delay = self.settings.backoff_for(task.attempts);
        task.status = TaskStatus::Pending;
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            path = %task.local_path.display(),
            attempt = task.attempts,
            max_attempts = self.settings.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "upload failed, will retry: {}",
            err
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => {
                    warn!(path = %task.local_path.display(), "retry dropped at shutdown");
                    shared.release(&task.local_path);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(mpsc::error::SendError(task)) = shared.sender.send(task) {
                        shared.release(&task.local_path);
                    }
                }
            }
        });
    }

    fn fail(&self, mut task: UploadTask, kind: FailureKind, message: String) {
        task.status = TaskStatus::Failed;
        error!(
            path = %task.local_path.display(),
            attempts = task.attempts,
            kind = ?kind,
            "upload failed: {}",
            message
        );
        self.record_failure(FailureRecord {
            task_id: task.id,
            local_path: task.local_path.clone(),
            remote_path: task.remote_path.clone(),
            kind,
            attempts: task.attempts,
            last_error: message,
            failed_at: Utc::now(),
        });
        self.release(&task.local_path);
    }

    fn record_failure(&self, record: FailureRecord) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.local_path.clone(), record);
    }
}
