//! Upload tasks owned by the worker pool.

use crate::models::{event::MediaIdentity, event::TransferEvent, remote::RemoteFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// One organized file on its way to remote storage.
///
/// Created by the intake, owned by the upload pool until it reaches a
/// terminal status.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadTask {
    pub id: Uuid,

    pub local_path: PathBuf,

    /// Filled by the worker from the path rules on the first attempt.
    pub remote_path: Option<String>,

    pub media: MediaIdentity,

    pub download_hash: Option<String>,

    /// Upload attempts made so far.
    pub attempts: u32,

    /// Attempts that ended with the credential being rejected.
    pub auth_failures: u32,

    pub status: TaskStatus,

    pub enqueued_at: DateTime<Utc>,

    /// Set once the upload succeeded.
    pub remote_file: Option<RemoteFile>,
}

impl UploadTask {
    pub fn from_event(event: TransferEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_path: event.local_path,
            remote_path: None,
            media: event.media,
            download_hash: event.download_hash,
            attempts: 0,
            auth_failures: 0,
            status: TaskStatus::Pending,
            enqueued_at: Utc::now(),
            remote_file: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.local_path.display().to_string())
    }

    /// Read-only snapshot handed downstream once the upload succeeded.
    pub fn completion(&self) -> Option<CompletedUpload> {
        if self.status != TaskStatus::Succeeded {
            return None;
        }
        let remote = self.remote_file.clone()?;
        Some(CompletedUpload {
            task_id: self.id,
            local_path: self.local_path.clone(),
            media: self.media.clone(),
            remote,
            completed_at: Utc::now(),
        })
    }
}

/// A succeeded upload as seen by the share aggregator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompletedUpload {
    pub task_id: Uuid,
    pub local_path: PathBuf,
    pub media: MediaIdentity,
    pub remote: RemoteFile,
    pub completed_at: DateTime<Utc>,
}
