//! Resumable upload sessions.
//!
//! Files above the simple-upload limit go through an upload session:
//! create the session (guarded by If-Match), PUT fixed-size chunks to
//! the session URL, and finish when the server answers with the final
//! item. Session URL and confirmed byte count are persisted after
//! every chunk through [`SessionPersistence`], keyed by
//! `(parent, name)`, so a crashed process resumes from the last
//! confirmed chunk instead of starting over.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use nimbus_core::backoff::Backoff;
use nimbus_core::domain::newtypes::{ETag, ItemId};
use nimbus_core::ports::remote_drive::RemoteItem;
use nimbus_core::NimbusError;

use crate::client::{encode_segment, GraphClient};
use crate::error::{is_retryable, status_to_error};
use crate::offline::classify_transport_error;
use crate::types::{DriveItemDto, UploadSessionDto, UploadStatusDto};

/// Upload chunk size: 10 MiB, a multiple of the required 320 KiB.
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Chunk attempts before the upload fails as transient.
const MAX_CHUNK_ATTEMPTS: u32 = 5;

// ============================================================================
// Session persistence port
// ============================================================================

/// Durable state of one session, as persisted between chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    /// The session URL to PUT chunks to.
    pub upload_url: String,
    /// Size of the file being transferred.
    pub total_size: u64,
    /// Bytes the server has confirmed.
    pub bytes_confirmed: u64,
}

/// Storage hook for session state. Implemented over the metadata
/// store by the engine wiring; a `None` persistence means sessions
/// simply restart after a crash.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Load the persisted session for `(parent, name)`, if any.
    async fn load(&self, parent_id: &ItemId, name: &str) -> Option<PersistedSession>;

    /// Persist the session after a confirmed chunk. Failures are
    /// logged by the implementation, never propagated: losing resume
    /// state only costs a restart.
    async fn save(&self, parent_id: &ItemId, name: &str, session: &PersistedSession);

    /// Drop the session after completion or abandonment.
    async fn clear(&self, parent_id: &ItemId, name: &str);
}

// ============================================================================
// SessionUploader
// ============================================================================

/// Drives one resumable upload.
pub struct SessionUploader<'a> {
    client: &'a GraphClient,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl<'a> SessionUploader<'a> {
    pub(crate) fn new(
        client: &'a GraphClient,
        persistence: Option<Arc<dyn SessionPersistence>>,
    ) -> Self {
        Self {
            client,
            persistence,
        }
    }

    /// Upload `source` to `name` under `parent_id`, resuming a
    /// persisted session when one matches.
    pub async fn upload(
        &self,
        parent_id: &ItemId,
        name: &str,
        source: &Path,
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError> {
        let total_size = tokio::fs::metadata(source).await?.len();

        let (upload_url, mut offset) = match self.resume_candidate(parent_id, name, total_size).await
        {
            Some((url, offset)) => {
                tracing::info!(name, offset, "Resuming upload session");
                (url, offset)
            }
            None => {
                let url = self.create_session(parent_id, name, if_match).await?;
                (url, 0)
            }
        };

        let mut file = tokio::fs::File::open(source).await?;
        let mut upload_url = upload_url;
        let mut recreated = false;

        loop {
            if offset >= total_size {
                // Chunk loop should have returned the final item; a
                // zero-length session never gets here because small
                // uploads handle short content.
                return Err(NimbusError::Transient(
                    "upload session ended without a final item".to_string(),
                ));
            }

            let end = (offset + CHUNK_SIZE).min(total_size) - 1;
            let len = end - offset + 1;

            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk).await?;

            match self
                .put_chunk(&upload_url, chunk, offset, end, total_size)
                .await
            {
                Ok(ChunkOutcome::Accepted { next_offset }) => {
                    offset = next_offset.unwrap_or(end + 1);
                    self.persist(parent_id, name, &upload_url, total_size, offset)
                        .await;
                }
                Ok(ChunkOutcome::Complete(item)) => {
                    if let Some(p) = &self.persistence {
                        p.clear(parent_id, name).await;
                    }
                    tracing::info!(name, total_size, "Upload session completed");
                    return Ok(item);
                }
                Err(NimbusError::NotFound(_)) if !recreated => {
                    // The session expired server-side; start a fresh
                    // one exactly once.
                    tracing::warn!(name, "Upload session expired, recreating");
                    recreated = true;
                    upload_url = self.create_session(parent_id, name, if_match).await?;
                    offset = 0;
                }
                Err(e) => {
                    // Keep the persisted state for a later resume.
                    return Err(e);
                }
            }
        }
    }

    /// The persisted session, if it matches the file we are about to
    /// send and the server still knows it.
    async fn resume_candidate(
        &self,
        parent_id: &ItemId,
        name: &str,
        total_size: u64,
    ) -> Option<(String, u64)> {
        let persistence = self.persistence.as_ref()?;
        let saved = persistence.load(parent_id, name).await?;
        if saved.total_size != total_size {
            // The file changed since the session was created.
            persistence.clear(parent_id, name).await;
            return None;
        }

        // Ask the server where to resume; its answer beats ours.
        match self.query_status(&saved.upload_url).await {
            Ok(Some(offset)) => Some((saved.upload_url, offset)),
            Ok(None) => Some((saved.upload_url, saved.bytes_confirmed)),
            Err(_) => {
                persistence.clear(parent_id, name).await;
                None
            }
        }
    }

    async fn create_session(
        &self,
        parent_id: &ItemId,
        name: &str,
        if_match: Option<&ETag>,
    ) -> Result<String, NimbusError> {
        let url = format!(
            "{}/me/drive/items/{}:/{}:/createUploadSession",
            self.client.base_url(),
            parent_id.as_str(),
            encode_segment(name)
        );
        let body = serde_json::json!({
            "item": {
                "@microsoft.graph.conflictBehavior": "replace",
                "name": name,
            }
        });

        let if_match = if_match.map(|e| e.as_str().to_string());
        let response = self
            .client
            .send(Method::POST, &url, move |r| {
                let r = r.json(&body);
                match &if_match {
                    Some(tag) => r.header("If-Match", tag),
                    None => r,
                }
            })
            .await?;

        let session: UploadSessionDto = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("session parse: {e}")))?;
        Ok(session.upload_url)
    }

    /// GET the session status; `Ok(Some(offset))` is the server's
    /// resume point, `Ok(None)` means the server gave no ranges.
    async fn query_status(&self, upload_url: &str) -> Result<Option<u64>, NimbusError> {
        let response = self
            .client
            .http()
            .get(upload_url)
            .send()
            .await
            .map_err(|e| classify_transport_error(self.client.context(), &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body));
        }
        let parsed: UploadStatusDto = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("status parse: {e}")))?;
        Ok(parsed.resume_offset())
    }

    /// PUT one chunk with its own retry loop. Session URLs are
    /// pre-authenticated, so no bearer token is attached.
    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Vec<u8>,
        start: u64,
        end: u64,
        total: u64,
    ) -> Result<ChunkOutcome, NimbusError> {
        let mut backoff = Backoff::network();

        loop {
            let response = self
                .client
                .http()
                .put(upload_url)
                .header("Content-Range", format!("bytes {start}-{end}/{total}"))
                .body(chunk.clone())
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let err = classify_transport_error(self.client.context(), &e);
                    if err.is_offline() || backoff.failures() + 1 >= MAX_CHUNK_ATTEMPTS {
                        return Err(err);
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            let status = response.status();
            match status {
                StatusCode::ACCEPTED => {
                    let next = response
                        .json::<UploadStatusDto>()
                        .await
                        .ok()
                        .and_then(|s| s.resume_offset());
                    return Ok(ChunkOutcome::Accepted { next_offset: next });
                }
                StatusCode::OK | StatusCode::CREATED => {
                    let dto: DriveItemDto = response
                        .json()
                        .await
                        .map_err(|e| NimbusError::Transient(format!("final item parse: {e}")))?;
                    return Ok(ChunkOutcome::Complete(dto.into_remote_item()?));
                }
                s if is_retryable(s) && backoff.failures() + 1 < MAX_CHUNK_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    tracing::debug!(%s, start, delay_ms = delay.as_millis() as u64, "Chunk retry");
                    tokio::time::sleep(delay).await;
                }
                s => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(status_to_error(s, &body));
                }
            }
        }
    }

    async fn persist(
        &self,
        parent_id: &ItemId,
        name: &str,
        upload_url: &str,
        total_size: u64,
        bytes_confirmed: u64,
    ) {
        if let Some(p) = &self.persistence {
            p.save(
                parent_id,
                name,
                &PersistedSession {
                    upload_url: upload_url.to_string(),
                    total_size,
                    bytes_confirmed,
                },
            )
            .await;
        }
    }
}

enum ChunkOutcome {
    /// Chunk stored; `next_offset` is the server's preferred resume
    /// point when it reported one.
    Accepted { next_offset: Option<u64> },
    /// Transfer finished; the final item metadata.
    Complete(RemoteItem),
}
