//! Rows of the host's transfer-history table.
//!
//! The host owns this table. The pipeline reads it and flips the storage
//! location of a row from the local kind to the remote kind, nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One organized file as recorded by the host.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct HistoryRecord {
    pub id: i64,

    /// Absolute local path, unique per row.
    pub local_path: String,

    /// Storage kind the file currently lives on (e.g. "local", "u115").
    pub dest_storage: String,

    /// Remote path, set when the row was reconciled.
    pub remote_path: Option<String>,

    /// Provider file id, set when the row was reconciled.
    pub remote_file_id: Option<String>,

    pub title: String,

    pub season: Option<i64>,

    pub episode: Option<i64>,

    pub download_hash: Option<String>,

    pub last_modified: DateTime<Utc>,
}
