//! Share batches and the links produced from them.

use crate::models::{
    event::{MediaIdentity, MediaKind},
    task::CompletedUpload,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Which completed uploads belong together in one share.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupingKey {
    Movie { media_id: String },
    Season { media_id: String, season: u32 },
}

impl GroupingKey {
    pub fn for_media(media: &MediaIdentity) -> Self {
        match media.kind {
            MediaKind::Movie => Self::Movie {
                media_id: media.media_id(),
            },
            MediaKind::Tv => Self::Season {
                media_id: media.media_id(),
                season: media.season.unwrap_or(1),
            },
        }
    }

    pub fn media_id(&self) -> &str {
        match self {
            Self::Movie { media_id } | Self::Season { media_id, .. } => media_id,
        }
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Movie { media_id } => write!(f, "movie:{}", media_id),
            Self::Season { media_id, season } => write!(f, "tv:{}:S{:02}", media_id, season),
        }
    }
}

/// How a batch decides it is complete.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Close as soon as this many distinct files arrived (or at the deadline).
    ExpectedCount(u32),
    /// Member count unknown; only the deadline closes the batch.
    DeadlineOnly,
}

impl BatchMode {
    /// Movies default to a single file; seasons of unknown length wait for the deadline.
    pub fn for_media(media: &MediaIdentity) -> Self {
        match (media.expected_count, media.kind) {
            (Some(count), _) if count > 0 => Self::ExpectedCount(count),
            (_, MediaKind::Movie) => Self::ExpectedCount(1),
            (_, MediaKind::Tv) => Self::DeadlineOnly,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Closed,
}

/// Completed uploads waiting to be shared together.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShareBatch {
    pub key: GroupingKey,
    pub mode: BatchMode,
    pub members: Vec<CompletedUpload>,
    pub state: BatchState,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl ShareBatch {
    pub fn open(first: CompletedUpload, now: DateTime<Utc>, debounce: Duration) -> Self {
        Self {
            key: GroupingKey::for_media(&first.media),
            mode: BatchMode::for_media(&first.media),
            members: vec![first],
            state: BatchState::Open,
            opened_at: now,
            deadline: now + debounce,
        }
    }

    /// Add a member and push the deadline out. A re-upload of a path already in
    /// the batch replaces the earlier entry instead of counting twice.
    pub fn admit(&mut self, member: CompletedUpload, now: DateTime<Utc>, debounce: Duration) {
        match self
            .members
            .iter_mut()
            .find(|existing| existing.local_path == member.local_path)
        {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
        self.deadline = now + debounce;
    }

    pub fn is_complete(&self) -> bool {
        match self.mode {
            BatchMode::ExpectedCount(expected) => self.members.len() >= expected as usize,
            BatchMode::DeadlineOnly => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.members.is_empty() && now >= self.deadline
    }

    pub fn close(mut self) -> Self {
        self.state = BatchState::Closed;
        self
    }

    pub fn title(&self) -> &str {
        self.members
            .first()
            .map(|m| m.media.title.as_str())
            .unwrap_or_else(|| self.key.media_id())
    }
}

/// Whether a closed batch is shared as its remote folder or as a file bundle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    Folder,
    #[default]
    Files,
}

impl FromStr for ShareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folder" => Ok(Self::Folder),
            "file" | "files" => Ok(Self::Files),
            other => Err(format!("unknown share mode `{}`", other)),
        }
    }
}

/// Expiry and extraction code applied to a new share.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ShareTerms {
    /// `None` keeps the share permanently.
    pub expiry_days: Option<u32>,
    pub receive_code: Option<String>,
}

/// A share link created by the provider.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShareResult {
    pub share_url: String,
    pub share_code: String,
    pub receive_code: Option<String>,
    pub expiry_days: Option<u32>,
}
