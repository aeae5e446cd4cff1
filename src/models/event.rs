//! Transfer events emitted by the host once a file has been organized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Opaque host storage identifier (`local`, `u115`, ...).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct StorageKind(String);

impl StorageKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Tv,
}

/// What the organized file is, as recognized by the host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MediaIdentity {
    pub kind: MediaKind,

    /// Display title (e.g. "流浪地球2").
    pub title: String,

    #[serde(default)]
    pub year: Option<u16>,

    /// External catalogue id (TMDB), preferred over the title for grouping.
    #[serde(default)]
    pub tmdb_id: Option<i64>,

    #[serde(default)]
    pub season: Option<u32>,

    #[serde(default)]
    pub episode: Option<u32>,

    /// Number of files the host expects for this movie or season, when known.
    #[serde(default)]
    pub expected_count: Option<u32>,
}

impl MediaIdentity {
    /// Stable id used for share skip-lists and grouping.
    pub fn media_id(&self) -> String {
        match self.tmdb_id {
            Some(id) => id.to_string(),
            None => match self.year {
                Some(year) => format!("{} ({})", self.title, year),
                None => self.title.clone(),
            },
        }
    }
}

/// A "transfer complete" notification from the host.
///
/// Immutable and consumed once by the intake.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransferEvent {
    /// Absolute path of the organized (hardlinked) file.
    pub local_path: PathBuf,

    pub source_storage: StorageKind,

    pub dest_storage: StorageKind,

    pub media: MediaIdentity,

    /// Host download identifier, when the transfer came from a download.
    #[serde(default)]
    pub download_hash: Option<String>,

    #[serde(default = "Utc::now")]
    pub transferred_at: DateTime<Utc>,
}
