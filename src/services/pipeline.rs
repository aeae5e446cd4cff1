//! Wires intake, upload pool and share aggregator together and owns their
//! start/stop lifecycle.

use crate::{
    models::event::StorageKind,
    services::{
        history_service::Reconcile,
        intake::EventIntake,
        notifier::NotificationSink,
        path_mapper::RuleStore,
        remote_client::RemoteStorage,
        share_aggregator::{Clock, ShareAggregator, ShareSettings, ShareStats, ShareStatsSnapshot},
        upload_pool::{PoolDeps, PoolHandle, PoolSettings, PoolStatsSnapshot, UploadPool},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub local_kind: StorageKind,
    pub pool: PoolSettings,
    /// `None` disables sharing entirely.
    pub share: Option<ShareSettings>,
}

/// External collaborators, injected so tests can swap in fakes.
pub struct PipelineParts {
    pub rules: RuleStore,
    pub remote: Arc<dyn RemoteStorage>,
    pub history: Arc<dyn Reconcile>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub subscribed: bool,
    pub uploads: PoolStatsSnapshot,
    pub shares: Option<ShareStatsSnapshot>,
}

/// Cloneable view of a running pipeline for request handlers.
#[derive(Clone)]
pub struct PipelineHandle {
    pub intake: Arc<EventIntake>,
    pub pool: PoolHandle,
    pub rules: RuleStore,
    share_stats: Option<Arc<ShareStats>>,
}

impl PipelineHandle {
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            subscribed: self.intake.is_subscribed(),
            uploads: self.pool.stats(),
            shares: self.share_stats.as_ref().map(|stats| stats.snapshot()),
        }
    }
}

pub struct Pipeline {
    handle: PipelineHandle,
    pool: UploadPool,
    aggregator: Option<ShareAggregator>,
    share_shutdown: CancellationToken,
}

impl Pipeline {
    /// Start the aggregator, then the workers, then subscribe the intake.
    pub fn start(settings: PipelineSettings, parts: PipelineParts) -> Self {
        let share_shutdown = CancellationToken::new();
        let aggregator = settings.share.map(|share| {
            info!(mode = ?share.mode, debounce_secs = share.debounce.as_secs(), "sharing enabled");
            ShareAggregator::spawn(
                share,
                parts.remote.clone(),
                parts.sink,
                parts.clock,
                share_shutdown.clone(),
            )
        });

        let pool = UploadPool::start(
            settings.pool,
            PoolDeps {
                rules: parts.rules.clone(),
                remote: parts.remote,
                history: parts.history,
                completions: aggregator.as_ref().map(ShareAggregator::sender),
            },
            CancellationToken::new(),
        );

        let intake = Arc::new(EventIntake::new(settings.local_kind, pool.handle()));
        intake.subscribe();

        let handle = PipelineHandle {
            intake,
            pool: pool.handle(),
            rules: parts.rules,
            share_stats: aggregator.as_ref().map(ShareAggregator::stats),
        };

        Self {
            handle,
            pool,
            aggregator,
            share_shutdown,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Unsubscribe, drain in-flight uploads, then stop the aggregator and
    /// wait for its share requests. Open share batches are dropped.
    pub async fn shutdown(self) {
        self.handle.intake.unsubscribe();
        self.pool.shutdown().await;
        self.share_shutdown.cancel();
        if let Some(aggregator) = self.aggregator {
            aggregator.join().await;
        }
        info!("pipeline stopped");
    }
}
