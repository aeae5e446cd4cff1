//! Entry point for host "file organized" events.

use crate::{
    models::{
        event::{StorageKind, TransferEvent},
        task::UploadTask,
    },
    services::{
        path_mapper::is_normalized,
        upload_pool::{PoolHandle, SubmitOutcome},
    },
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum IntakeDecision {
    Enqueued { task_id: Uuid },
    /// The event is not a local-to-local organize.
    Ignored { reason: String },
    /// An upload for the same path is already pending.
    Duplicate,
    /// The pipeline is stopped or stopping.
    NotSubscribed,
}

/// Filters transfer events and turns accepted ones into upload tasks.
pub struct EventIntake {
    local_kind: StorageKind,
    pool: PoolHandle,
    subscribed: AtomicBool,
}

impl EventIntake {
    pub fn new(local_kind: StorageKind, pool: PoolHandle) -> Self {
        Self {
            local_kind,
            pool,
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) {
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            info!(kind = %self.local_kind, "listening for transfer events");
        }
    }

    pub fn unsubscribe(&self) {
        if self.subscribed.swap(false, Ordering::SeqCst) {
            info!("stopped listening for transfer events");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Never blocks: accepted events go onto the unbounded upload queue.
    pub fn on_transfer_event(&self, event: TransferEvent) -> IntakeDecision {
        if !self.is_subscribed() {
            warn!(path = %event.local_path.display(), "transfer event discarded, intake not subscribed");
            return IntakeDecision::NotSubscribed;
        }

        if event.source_storage != self.local_kind || event.dest_storage != self.local_kind {
            debug!(
                path = %event.local_path.display(),
                source = %event.source_storage,
                dest = %event.dest_storage,
                "ignoring transfer outside local storage"
            );
            return IntakeDecision::Ignored {
                reason: format!(
                    "transfer {} -> {} is not {} -> {}",
                    event.source_storage, event.dest_storage, self.local_kind, self.local_kind
                ),
            };
        }

        if !event.local_path.is_absolute() {
            return IntakeDecision::Ignored {
                reason: format!("path `{}` is not absolute", event.local_path.display()),
            };
        }

        if !is_normalized(&event.local_path) {
            return IntakeDecision::Ignored {
                reason: format!(
                    "path `{}` contains `.` or `..` segments",
                    event.local_path.display()
                ),
            };
        }

        let task = UploadTask::from_event(event);
        let path = task.local_path.clone();
        match self.pool.submit(task) {
            SubmitOutcome::Queued(task_id) => {
                info!(path = %path.display(), task = %task_id, "upload queued");
                IntakeDecision::Enqueued { task_id }
            }
            SubmitOutcome::Duplicate => IntakeDecision::Duplicate,
            SubmitOutcome::Closed => IntakeDecision::NotSubscribed,
        }
    }
}
