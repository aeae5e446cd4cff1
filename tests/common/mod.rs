#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloud_offload::models::{
    event::{MediaIdentity, MediaKind, StorageKind, TransferEvent},
    remote::{RemoteEntry, RemoteFile},
    share::{ShareResult, ShareTerms},
    task::UploadTask,
};
use cloud_offload::services::{
    history_service::{HistoryResult, Reconcile, ReconcileOutcome},
    notifier::{NotificationSink, ShareNotice},
    path_mapper::{PathMapper, PathRule, RuleStore},
    remote_client::{RemoteError, RemoteResult, RemoteStorage},
    share_aggregator::Clock,
    upload_pool::PoolSettings,
};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

//===============
// Fixtures
//===============

pub fn rules() -> RuleStore {
    RuleStore::from_mapper(PathMapper::new(vec![
        PathRule {
            local: "/media".into(),
            remote: "/remote".into(),
        },
        PathRule {
            local: "/media/tv".into(),
            remote: "/remote/series".into(),
        },
    ]))
}

/// Small delays so retry tests finish quickly.
pub fn fast_pool(workers: usize) -> PoolSettings {
    PoolSettings {
        workers,
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        attempt_timeout: Duration::from_secs(5),
        auth_retry_limit: 2,
    }
}

pub fn movie(title: &str) -> MediaIdentity {
    MediaIdentity {
        kind: MediaKind::Movie,
        title: title.into(),
        year: Some(2023),
        tmdb_id: None,
        season: None,
        episode: None,
        expected_count: None,
    }
}

pub fn episode(title: &str, season: u32, episode: u32, expected: Option<u32>) -> MediaIdentity {
    MediaIdentity {
        kind: MediaKind::Tv,
        title: title.into(),
        year: None,
        tmdb_id: Some(1399),
        season: Some(season),
        episode: Some(episode),
        expected_count: expected,
    }
}

pub fn local_event(path: &str, media: MediaIdentity) -> TransferEvent {
    TransferEvent {
        local_path: PathBuf::from(path),
        source_storage: StorageKind::new("local"),
        dest_storage: StorageKind::new("local"),
        media,
        download_hash: Some("abc123".into()),
        transferred_at: Utc::now(),
    }
}

pub fn task(path: &str) -> UploadTask {
    UploadTask::from_event(local_event(path, movie("Test Movie")))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//===============
// Remote storage
//===============

/// Outcome of one scripted upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ok,
    Timeout,
    RateLimited,
    Transient,
    AuthExpired,
    Rejected,
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedShare {
    Folder(String),
    Packaged(Vec<String>),
}

/// In-memory provider. Uploads follow a per-path script (then succeed) and
/// the gauge records the highest number of concurrent uploads.
#[derive(Default)]
pub struct FakeRemote {
    scripts: Mutex<HashMap<PathBuf, VecDeque<Step>>>,
    always: Mutex<HashMap<PathBuf, Step>>,
    attempts: Mutex<HashMap<PathBuf, u32>>,
    shares: Mutex<Vec<(RecordedShare, ShareTerms)>>,
    fail_shares: Mutex<bool>,
    delay: Mutex<Duration>,
    share_delay: Mutex<Duration>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, path: &str, steps: &[Step]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), steps.iter().copied().collect());
    }

    /// Every attempt for `path` ends with `step`.
    pub fn always(&self, path: &str, step: Step) {
        self.always.lock().unwrap().insert(PathBuf::from(path), step);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Share requests take this long before they are recorded.
    pub fn set_share_delay(&self, delay: Duration) {
        *self.share_delay.lock().unwrap() = delay;
    }

    pub fn fail_shares(&self) {
        *self.fail_shares.lock().unwrap() = true;
    }

    pub fn attempts(&self, path: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn shares(&self) -> Vec<(RecordedShare, ShareTerms)> {
        self.shares.lock().unwrap().clone()
    }

    fn next_step(&self, local: &Path) -> Step {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(local.to_path_buf())
            .or_insert(0) += 1;
        if let Some(step) = self.always.lock().unwrap().get(local) {
            return *step;
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(local)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok)
    }

    async fn share_pause(&self) {
        let delay = *self.share_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record_share(&self, share: RecordedShare, terms: &ShareTerms) -> RemoteResult<ShareResult> {
        if *self.fail_shares.lock().unwrap() {
            return Err(RemoteError::Rejected("share quota exceeded".into()));
        }
        let mut shares = self.shares.lock().unwrap();
        shares.push((share, terms.clone()));
        let code = format!("s{}", shares.len());
        Ok(ShareResult {
            share_url: format!("https://share.test/s/{}", code),
            share_code: code,
            receive_code: terms.receive_code.clone(),
            expiry_days: terms.expiry_days,
        })
    }
}

#[async_trait]
impl RemoteStorage for FakeRemote {
    async fn ensure_folder(&self, remote_dir: &str) -> RemoteResult<String> {
        Ok(format!("dir:{}", remote_dir))
    }

    async fn list_folder(&self, _folder_id: &str) -> RemoteResult<Vec<RemoteEntry>> {
        Ok(Vec::new())
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> RemoteResult<RemoteFile> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let step = self.next_step(local);
        self.current.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Ok => {
                let (parent, name) = remote_path.rsplit_once('/').unwrap_or(("", remote_path));
                Ok(RemoteFile {
                    file_id: format!("file:{}", name),
                    parent_id: format!("dir:{}", parent),
                    remote_path: remote_path.to_string(),
                    size_bytes: 1024,
                    deduplicated: false,
                })
            }
            Step::Timeout => Err(RemoteError::Timeout),
            Step::RateLimited => Err(RemoteError::RateLimited),
            Step::Transient => Err(RemoteError::Transient("connection reset".into())),
            Step::AuthExpired => Err(RemoteError::AuthExpired(401)),
            Step::Rejected => Err(RemoteError::Rejected("file name not allowed".into())),
            Step::Vanished => Err(RemoteError::FileVanished(local.to_path_buf())),
        }
    }

    async fn create_folder_share(
        &self,
        folder_id: &str,
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult> {
        self.share_pause().await;
        self.record_share(RecordedShare::Folder(folder_id.to_string()), terms)
    }

    async fn create_packaged_share(
        &self,
        file_ids: &[String],
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult> {
        self.share_pause().await;
        self.record_share(RecordedShare::Packaged(file_ids.to_vec()), terms)
    }
}

//===============
// History
//===============

/// Records every reconcile call and answers `Updated`.
#[derive(Default)]
pub struct CountingReconciler {
    calls: Mutex<Vec<UploadTask>>,
}

impl CountingReconciler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<UploadTask> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.local_path == Path::new(path))
            .count()
    }
}

#[async_trait]
impl Reconcile for CountingReconciler {
    async fn reconcile(&self, task: &UploadTask) -> HistoryResult<ReconcileOutcome> {
        self.calls.lock().unwrap().push(task.clone());
        Ok(ReconcileOutcome::Updated)
    }
}

//===============
// Sharing
//===============

#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<ShareNotice>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<ShareNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notice: ShareNotice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
