//! src/services/share_aggregator.rs
//!
//! ShareAggregator: groups succeeded uploads by movie or by show season and
//! turns each complete group into one share link.
//!
//! A single task owns the open batches: completions arrive on its channel and
//! a periodic sweep closes batches whose deadline passed. Deadlines are plain
//! timestamps read from a [`Clock`], so [`BatchBook`] can be driven directly
//! in tests.

use crate::{
    models::{
        share::{GroupingKey, ShareBatch, ShareMode, ShareResult, ShareTerms},
        task::CompletedUpload,
    },
    services::{
        notifier::{NotificationSink, ShareNotice},
        remote_client::RemoteStorage,
        share_policy::CodePolicy,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of "now" for batch deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct ShareSettings {
    pub mode: ShareMode,
    /// Quiet period after the last arrival before a batch closes.
    pub debounce: Duration,
    /// How often open batches are checked against their deadline.
    pub sweep_interval: Duration,
    pub expiry_days: Option<u32>,
    pub codes: CodePolicy,
    /// Media ids that are uploaded but never shared.
    pub skip_media_ids: HashSet<String>,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            mode: ShareMode::Files,
            debounce: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            expiry_days: None,
            codes: CodePolicy::None,
            skip_media_ids: HashSet::new(),
        }
    }
}

/// Open batches keyed by grouping key.
#[derive(Debug)]
pub struct BatchBook {
    batches: HashMap<GroupingKey, ShareBatch>,
    debounce: chrono::Duration,
}

impl BatchBook {
    pub fn new(debounce: Duration) -> Self {
        Self {
            batches: HashMap::new(),
            debounce: chrono::Duration::from_std(debounce)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Add a completion. Returns the batch when this arrival completed it.
    pub fn admit(&mut self, upload: CompletedUpload, now: DateTime<Utc>) -> Option<ShareBatch> {
        let key = GroupingKey::for_media(&upload.media);
        match self.batches.get_mut(&key) {
            Some(batch) => batch.admit(upload, now, self.debounce),
            None => {
                debug!(group = %key, "opening share batch");
                self.batches
                    .insert(key.clone(), ShareBatch::open(upload, now, self.debounce));
            }
        }

        let complete = self.batches.get(&key).is_some_and(ShareBatch::is_complete);
        if complete {
            self.batches.remove(&key).map(ShareBatch::close)
        } else {
            None
        }
    }

    /// Remove and return every batch whose deadline has passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ShareBatch> {
        let expired: Vec<GroupingKey> = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.batches.remove(&key))
            .map(ShareBatch::close)
            .collect()
    }

    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }
}

#[derive(Debug, Default)]
pub struct ShareStats {
    pub batches_closed: AtomicU64,
    pub shared: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareStatsSnapshot {
    pub batches_closed: u64,
    pub shared: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ShareStats {
    pub fn snapshot(&self) -> ShareStatsSnapshot {
        ShareStatsSnapshot {
            batches_closed: self.batches_closed.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// How a closed batch will be shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharePlan {
    Folder(String),
    Packaged(Vec<String>),
}

/// Turns closed batches into shares and notifications.
#[derive(Clone)]
pub struct SharePublisher {
    remote: Arc<dyn RemoteStorage>,
    sink: Arc<dyn NotificationSink>,
    settings: Arc<ShareSettings>,
    stats: Arc<ShareStats>,
}

impl SharePublisher {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        sink: Arc<dyn NotificationSink>,
        settings: Arc<ShareSettings>,
        stats: Arc<ShareStats>,
    ) -> Self {
        Self {
            remote,
            sink,
            settings,
            stats,
        }
    }

    /// Folder share only when the mode asks for it and every member sits in
    /// the same remote folder; otherwise bundle the member files.
    pub fn plan(&self, batch: &ShareBatch) -> SharePlan {
        if self.settings.mode == ShareMode::Folder {
            if let Some(first) = batch.members.first() {
                let parent = &first.remote.parent_id;
                if batch.members.iter().all(|m| &m.remote.parent_id == parent) {
                    return SharePlan::Folder(parent.clone());
                }
            }
        }
        SharePlan::Packaged(
            batch
                .members
                .iter()
                .map(|m| m.remote.file_id.clone())
                .collect(),
        )
    }

    /// Create the share for a closed batch. Failures are logged and the batch
    /// is dropped; the uploads themselves stand.
    pub async fn publish(&self, batch: ShareBatch) -> Option<ShareResult> {
        self.stats.batches_closed.fetch_add(1, Ordering::Relaxed);

        if self.settings.skip_media_ids.contains(batch.key.media_id()) {
            info!(group = %batch.key, "media is on the share skip-list");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let terms = ShareTerms {
            expiry_days: self.settings.expiry_days,
            receive_code: self.settings.codes.next_code(),
        };
        let plan = self.plan(&batch);
        let (mode, result) = match &plan {
            SharePlan::Folder(folder_id) => (
                ShareMode::Folder,
                self.remote.create_folder_share(folder_id, &terms).await,
            ),
            SharePlan::Packaged(file_ids) => (
                ShareMode::Files,
                self.remote.create_packaged_share(file_ids, &terms).await,
            ),
        };

        match result {
            Ok(share) => {
                self.stats.shared.fetch_add(1, Ordering::Relaxed);
                info!(
                    group = %batch.key,
                    files = batch.members.len(),
                    url = %share.share_url,
                    "share created"
                );
                let notice = ShareNotice {
                    title: batch.title().to_string(),
                    group: batch.key.to_string(),
                    mode,
                    file_count: batch.members.len(),
                    share: share.clone(),
                };
                self.sink.send(notice).await;
                Some(share)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(group = %batch.key, files = batch.members.len(), "share creation failed: {}", err);
                None
            }
        }
    }
}

/// Handle to the running aggregator task.
pub struct ShareAggregator {
    sender: mpsc::UnboundedSender<CompletedUpload>,
    stats: Arc<ShareStats>,
    task: JoinHandle<()>,
}

impl ShareAggregator {
    pub fn spawn(
        settings: ShareSettings,
        remote: Arc<dyn RemoteStorage>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(ShareStats::default());
        let settings = Arc::new(settings);
        let book = BatchBook::new(settings.debounce);
        let sweep_interval = settings.sweep_interval;
        let publisher = SharePublisher::new(remote, sink, settings, stats.clone());

        let task = tokio::spawn(run(receiver, book, publisher, clock, sweep_interval, shutdown));
        Self {
            sender,
            stats,
            task,
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<CompletedUpload> {
        self.sender.clone()
    }

    pub fn stats(&self) -> Arc<ShareStats> {
        self.stats.clone()
    }

    /// Wait for the aggregator loop to exit after its token was cancelled.
    pub async fn join(self) {
        drop(self.sender);
        if let Err(err) = self.task.await {
            warn!("share aggregator task ended abnormally: {}", err);
        }
    }
}

async fn run(
    mut receiver: mpsc::UnboundedReceiver<CompletedUpload>,
    mut book: BatchBook,
    publisher: SharePublisher,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut publishing = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = receiver.recv() => match received {
                Some(upload) => {
                    if let Some(batch) = book.admit(upload, clock.now()) {
                        spawn_publish(&mut publishing, &publisher, batch);
                    }
                }
                None => break,
            },
            Some(finished) = publishing.join_next(), if !publishing.is_empty() => {
                log_publish_end(finished);
            }
            _ = ticker.tick() => {
                for batch in book.sweep(clock.now()) {
                    spawn_publish(&mut publishing, &publisher, batch);
                }
            }
        }
    }

    // Completions sent by the last in-flight uploads are still admitted, so a
    // batch they complete gets shared.
    receiver.close();
    while let Ok(upload) = receiver.try_recv() {
        if let Some(batch) = book.admit(upload, clock.now()) {
            spawn_publish(&mut publishing, &publisher, batch);
        }
    }
    if book.open_batches() > 0 {
        warn!(open = book.open_batches(), "share aggregator stopped with open batches");
    }

    if !publishing.is_empty() {
        info!(pending = publishing.len(), "waiting for share requests to finish");
    }
    while let Some(finished) = publishing.join_next().await {
        log_publish_end(finished);
    }
}

fn spawn_publish(publishing: &mut JoinSet<()>, publisher: &SharePublisher, batch: ShareBatch) {
    let publisher = publisher.clone();
    publishing.spawn(async move {
        publisher.publish(batch).await;
    });
}

fn log_publish_end(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        error!("share publish task ended abnormally: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        event::{MediaIdentity, MediaKind},
        remote::RemoteFile,
        share::{BatchMode, BatchState},
    };
    use std::path::PathBuf;
    use uuid::Uuid;

    fn episode(n: u32, expected: Option<u32>) -> CompletedUpload {
        CompletedUpload {
            task_id: Uuid::new_v4(),
            local_path: PathBuf::from(format!("/media/tv/Show/S01/E{:02}.mkv", n)),
            media: MediaIdentity {
                kind: MediaKind::Tv,
                title: "Show".into(),
                year: None,
                tmdb_id: Some(42),
                season: Some(1),
                episode: Some(n),
                expected_count: expected,
            },
            remote: RemoteFile {
                file_id: format!("f{}", n),
                parent_id: "season-1".into(),
                remote_path: format!("/Emby/tv/Show/S01/E{:02}.mkv", n),
                size_bytes: 1,
                deduplicated: false,
            },
            completed_at: Utc::now(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn closes_when_expected_count_reached() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        for n in 1..=4 {
            assert!(book.admit(episode(n, Some(5)), at(n as i64)).is_none());
        }
        let batch = book.admit(episode(5, Some(5)), at(5)).expect("batch closes on 5th");
        assert_eq!(batch.members.len(), 5);
        assert_eq!(batch.state, BatchState::Closed);
        assert_eq!(book.open_batches(), 0);
    }

    #[test]
    fn deadline_closes_single_member_batch() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        assert!(book.admit(episode(1, None), at(0)).is_none());
        assert!(book.sweep(at(59)).is_empty());
        let closed = book.sweep(at(60));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].members.len(), 1);
        assert_eq!(closed[0].mode, BatchMode::DeadlineOnly);
        assert_eq!(book.open_batches(), 0);
    }

    #[test]
    fn arrivals_push_the_deadline_out() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        book.admit(episode(1, None), at(0));
        book.admit(episode(2, None), at(50));
        assert!(book.sweep(at(100)).is_empty());
        assert_eq!(book.sweep(at(110)).len(), 1);
    }

    #[test]
    fn late_member_opens_fresh_batch() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        book.admit(episode(1, None), at(0));
        assert_eq!(book.sweep(at(60)).len(), 1);

        assert!(book.admit(episode(2, None), at(61)).is_none());
        assert_eq!(book.open_batches(), 1);
        let closed = book.sweep(at(121));
        assert_eq!(closed[0].members.len(), 1);
        assert_eq!(closed[0].members[0].remote.file_id, "f2");
    }

    #[test]
    fn repeated_path_does_not_count_twice() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        assert!(book.admit(episode(1, Some(2)), at(0)).is_none());
        assert!(book.admit(episode(1, Some(2)), at(1)).is_none());
        assert!(book.admit(episode(2, Some(2)), at(2)).is_some());
    }

    #[test]
    fn movies_close_immediately() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        let mut movie = episode(1, None);
        movie.media.kind = MediaKind::Movie;
        movie.media.season = None;
        let batch = book.admit(movie, at(0)).expect("movie batch closes at once");
        assert_eq!(batch.mode, BatchMode::ExpectedCount(1));
    }

    #[test]
    fn seasons_are_grouped_separately() {
        let mut book = BatchBook::new(Duration::from_secs(60));
        let mut s2 = episode(1, None);
        s2.media.season = Some(2);
        book.admit(episode(1, None), at(0));
        book.admit(s2, at(0));
        assert_eq!(book.open_batches(), 2);
    }

    fn publisher(mode: ShareMode) -> SharePublisher {
        let remote = crate::services::remote_client::HttpRemoteStorage::new("http://remote.invalid", "")
            .unwrap();
        SharePublisher::new(
            Arc::new(remote),
            Arc::new(crate::services::notifier::LogSink),
            Arc::new(ShareSettings {
                mode,
                ..ShareSettings::default()
            }),
            Arc::new(ShareStats::default()),
        )
    }

    fn batch_of(members: Vec<CompletedUpload>) -> ShareBatch {
        let mut members = members.into_iter();
        let mut batch = ShareBatch::open(members.next().unwrap(), at(0), chrono::Duration::seconds(60));
        for member in members {
            batch.admit(member, at(1), chrono::Duration::seconds(60));
        }
        batch.close()
    }

    #[test]
    fn folder_mode_shares_common_parent() {
        let batch = batch_of(vec![episode(1, None), episode(2, None)]);
        assert_eq!(
            publisher(ShareMode::Folder).plan(&batch),
            SharePlan::Folder("season-1".into())
        );
        assert_eq!(
            publisher(ShareMode::Files).plan(&batch),
            SharePlan::Packaged(vec!["f1".into(), "f2".into()])
        );
    }

    #[test]
    fn folder_mode_falls_back_when_parents_differ() {
        let mut stray = episode(2, None);
        stray.remote.parent_id = "extras".into();
        let batch = batch_of(vec![episode(1, None), stray]);
        assert_eq!(
            publisher(ShareMode::Folder).plan(&batch),
            SharePlan::Packaged(vec!["f1".into(), "f2".into()])
        );
    }
}
