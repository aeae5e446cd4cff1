//! Descriptors returned by the remote storage provider.

use serde::{Deserialize, Serialize};

/// A file that now exists on the remote backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: String,

    /// Id of the folder holding the file.
    pub parent_id: String,

    pub remote_path: String,

    pub size_bytes: u64,

    /// True when the provider already had the content and skipped the transfer.
    pub deduplicated: bool,
}

/// One entry of a remote folder listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
}
