//! src/services/remote_client.rs
//!
//! Remote storage adapter. The pipeline only talks to the [`RemoteStorage`]
//! trait; [`HttpRemoteStorage`] implements it against the provider's JSON API
//! with an opaque session credential sent as a cookie.

use crate::models::{
    remote::{RemoteEntry, RemoteFile},
    share::{ShareResult, ShareTerms},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::TryStreamExt;
use md5::Context;
use reqwest::{Body, StatusCode, header};
use serde::Deserialize;
use serde_json::json;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

const HASH_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("local file `{0}` no longer exists")]
    FileVanished(PathBuf),
    #[error("remote request timed out")]
    Timeout,
    #[error("remote rate limit reached")]
    RateLimited,
    #[error("remote credential rejected (HTTP {0}); refresh the session cookie")]
    AuthExpired(u16),
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RemoteError {
    /// Network-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Transient(_) | Self::AuthExpired(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() || err.is_builder() {
            Self::Rejected(err.to_string())
        } else if let Some(status) = err.status() {
            classify_status(status, err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Operations the pipeline needs from the remote backend.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Resolve a remote directory path to its folder id, creating missing levels.
    async fn ensure_folder(&self, remote_dir: &str) -> RemoteResult<String>;

    async fn list_folder(&self, folder_id: &str) -> RemoteResult<Vec<RemoteEntry>>;

    async fn upload(&self, local: &Path, remote_path: &str) -> RemoteResult<RemoteFile>;

    async fn create_folder_share(
        &self,
        folder_id: &str,
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult>;

    async fn create_packaged_share(
        &self,
        file_ids: &[String],
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult>;
}

/// HTTP implementation of [`RemoteStorage`].
#[derive(Clone)]
pub struct HttpRemoteStorage {
    client: reqwest::Client,
    base_url: String,
    credential: String,
}

#[derive(Deserialize)]
struct FolderResponse {
    id: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
    #[serde(default)]
    deduplicated: bool,
}

#[derive(Deserialize)]
struct ShareResponse {
    share_url: String,
    share_code: String,
}

impl HttpRemoteStorage {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cloud-offload/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a prepared request and turn non-2xx answers into [`RemoteError`]s.
    async fn send(&self, request: reqwest::RequestBuilder) -> RemoteResult<reqwest::Response> {
        let response = request
            .header(header::COOKIE, &self.credential)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn share(&self, payload: serde_json::Value, terms: &ShareTerms) -> RemoteResult<ShareResult> {
        let response = self
            .send(self.client.post(self.url("/api/v1/shares")).json(&payload))
            .await?;
        let share: ShareResponse = response.json().await?;
        Ok(ShareResult {
            share_url: share.share_url,
            share_code: share.share_code,
            receive_code: terms.receive_code.clone(),
            expiry_days: terms.expiry_days,
        })
    }
}

#[async_trait]
impl RemoteStorage for HttpRemoteStorage {
    async fn ensure_folder(&self, remote_dir: &str) -> RemoteResult<String> {
        let response = self
            .send(
                self.client
                    .post(self.url("/api/v1/folders"))
                    .json(&json!({ "path": remote_dir })),
            )
            .await?;
        let folder: FolderResponse = response.json().await?;
        Ok(folder.id)
    }

    async fn list_folder(&self, folder_id: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/api/v1/folders/{}/entries", folder_id))),
            )
            .await?;
        Ok(response.json().await?)
    }

    /// Stream `local` into the folder holding `remote_path`.
    ///
    /// A same-named file of the same size already in the folder is taken as
    /// the result of an earlier attempt whose response got lost.
    async fn upload(&self, local: &Path, remote_path: &str) -> RemoteResult<RemoteFile> {
        let metadata = tokio::fs::metadata(local).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                RemoteError::FileVanished(local.to_path_buf())
            } else {
                RemoteError::Io(err)
            }
        })?;
        let size_bytes = metadata.len();
        let (parent_dir, name) = split_remote_path(remote_path)?;

        let parent_id = self.ensure_folder(parent_dir).await?;
        let existing = self.list_folder(&parent_id).await?;
        if let Some(entry) = existing
            .iter()
            .find(|entry| !entry.is_dir && entry.name == name && entry.size == size_bytes)
        {
            debug!(remote_path, file_id = %entry.id, "remote copy already present");
            return Ok(RemoteFile {
                file_id: entry.id.clone(),
                parent_id,
                remote_path: remote_path.to_string(),
                size_bytes,
                deduplicated: true,
            });
        }

        let content_md5 = file_md5_base64(local).await?;
        let file = File::open(local).await?;
        let trace_path = remote_path.to_string();
        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map_ok(move |chunk: Bytes| {
            sent += chunk.len() as u64;
            trace!(remote = %trace_path, sent, total = size_bytes, "upload progress");
            chunk
        });
        let body = Body::wrap_stream(stream);

        let response = self
            .send(
                self.client
                    .post(self.url("/api/v1/files"))
                    .query(&[("parent_id", parent_id.as_str()), ("name", name)])
                    .header(header::CONTENT_LENGTH, size_bytes)
                    .header("Content-MD5", content_md5)
                    .body(body),
            )
            .await?;
        let uploaded: UploadResponse = response.json().await?;

        Ok(RemoteFile {
            file_id: uploaded.id,
            parent_id,
            remote_path: remote_path.to_string(),
            size_bytes,
            deduplicated: uploaded.deduplicated,
        })
    }

    async fn create_folder_share(
        &self,
        folder_id: &str,
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult> {
        let payload = json!({
            "folder_id": folder_id,
            "expiry_days": terms.expiry_days,
            "receive_code": terms.receive_code,
        });
        self.share(payload, terms).await
    }

    async fn create_packaged_share(
        &self,
        file_ids: &[String],
        terms: &ShareTerms,
    ) -> RemoteResult<ShareResult> {
        if file_ids.is_empty() {
            return Err(RemoteError::Rejected("no files to share".into()));
        }
        let payload = json!({
            "file_ids": file_ids,
            "expiry_days": terms.expiry_days,
            "receive_code": terms.receive_code,
        });
        self.share(payload, terms).await
    }
}

/// Map an HTTP status onto the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::AuthExpired(status.as_u16()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        s if s.is_server_error() => RemoteError::Transient(format!("HTTP {}: {}", s.as_u16(), body)),
        s => RemoteError::Rejected(format!("HTTP {}: {}", s.as_u16(), body)),
    }
}

/// Split `/a/b/c.mkv` into (`/a/b`, `c.mkv`).
fn split_remote_path(remote_path: &str) -> RemoteResult<(&str, &str)> {
    match remote_path.rsplit_once('/') {
        Some((_, "")) | None => Err(RemoteError::Rejected(format!(
            "remote path `{}` has no file name",
            remote_path
        ))),
        Some(("", name)) => Ok(("/", name)),
        Some((dir, name)) => Ok((dir, name)),
    }
}

/// Base64 of the raw MD5 digest, the `Content-MD5` header format.
async fn file_md5_base64(path: &Path) -> RemoteResult<String> {
    let mut file = File::open(path).await?;
    let mut digest = Context::new();
    let mut buffer = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        digest.consume(&buffer[..read]);
    }
    Ok(general_purpose::STANDARD.encode(digest.compute().0))
}
