//! src/services/history_service.rs
//!
//! HistoryReconciler: flips the storage location of a host transfer-history
//! row from the local kind to the remote kind once the file is uploaded.
//! The host owns the table and may write it concurrently, so every change is
//! a single compare-and-set on the current storage location.

use crate::models::{event::StorageKind, history::HistoryRecord, task::UploadTask};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Row moved from the local kind to the remote kind.
    Updated,
    /// The host has no row for this path.
    NotFound,
    /// Row already points at the remote kind; nothing written.
    AlreadyReconciled,
    /// Row holds some other storage kind, or changed under us.
    Conflict { current: String },
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("task for `{0}` has not been uploaded")]
    NotUploaded(PathBuf),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Seam between the upload pool and the history store.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, task: &UploadTask) -> HistoryResult<ReconcileOutcome>;
}

/// SQLite-backed reconciler for the host's `transfer_history` table.
#[derive(Clone)]
pub struct HistoryReconciler {
    db: Arc<SqlitePool>,
    source_kind: StorageKind,
    dest_kind: StorageKind,
}

impl HistoryReconciler {
    pub fn new(db: Arc<SqlitePool>, source_kind: StorageKind, dest_kind: StorageKind) -> Self {
        Self {
            db,
            source_kind,
            dest_kind,
        }
    }

    /// Fetch the host row for `local_path`, if any.
    pub async fn fetch_record(&self, local_path: &str) -> HistoryResult<Option<HistoryRecord>> {
        let record = sqlx::query_as::<_, HistoryRecord>(
            "SELECT id, local_path, dest_storage, remote_path, remote_file_id, title,
                    season, episode, download_hash, last_modified
             FROM transfer_history WHERE local_path = ?",
        )
        .bind(local_path)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl Reconcile for HistoryReconciler {
    /// Flip the row with one guarded `UPDATE`, so the write is atomic and
    /// never holds a read lock that would need upgrading. Only when nothing
    /// matched is the row read back to classify the outcome.
    async fn reconcile(&self, task: &UploadTask) -> HistoryResult<ReconcileOutcome> {
        let (Some(remote_path), Some(remote_file)) = (&task.remote_path, &task.remote_file) else {
            return Err(HistoryError::NotUploaded(task.local_path.clone()));
        };
        let local_path = task.local_path.to_string_lossy();

        let result = sqlx::query(
            "UPDATE transfer_history
             SET dest_storage = ?, remote_path = ?, remote_file_id = ?, last_modified = ?
             WHERE local_path = ? AND dest_storage = ?",
        )
        .bind(self.dest_kind.as_str())
        .bind(remote_path)
        .bind(&remote_file.file_id)
        .bind(Utc::now())
        .bind(local_path.as_ref())
        .bind(self.source_kind.as_str())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() > 0 {
            info!(
                path = %local_path,
                from = %self.source_kind,
                to = %self.dest_kind,
                "history reconciled"
            );
            return Ok(ReconcileOutcome::Updated);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT dest_storage FROM transfer_history WHERE local_path = ?")
                .bind(local_path.as_ref())
                .fetch_optional(&*self.db)
                .await?;

        match current {
            None => {
                warn!(path = %local_path, "uploaded file has no transfer history row");
                Ok(ReconcileOutcome::NotFound)
            }
            Some(kind) if kind == self.dest_kind.as_str() => {
                debug!(path = %local_path, "history already reconciled");
                Ok(ReconcileOutcome::AlreadyReconciled)
            }
            Some(kind) => {
                warn!(path = %local_path, current = %kind, "history row holds unexpected storage");
                Ok(ReconcileOutcome::Conflict { current: kind })
            }
        }
    }
}
