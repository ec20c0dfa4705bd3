//! Graph API client.
//!
//! Typed HTTP surface over the Graph API v1.0 implementing the
//! [`RemoteDrive`] port. Every request:
//!
//! 1. short-circuits to `Offline` when operational offline is set,
//! 2. attaches a bearer token from the [`TokenProvider`] (one 401
//!    triggers invalidate-and-retry before giving up),
//! 3. retries transient failures (5xx, 429, network jitter) with
//!    jittered exponential backoff, honoring `Retry-After`,
//! 4. maps the final status into the process error taxonomy.
//!
//! Idempotent GETs flow through a short-TTL [`ResponseCache`];
//! mutations invalidate the affected item's entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use nimbus_core::backoff::Backoff;
use nimbus_core::context::NimbusContext;
use nimbus_core::domain::newtypes::{DeltaCursor, ETag, ItemId};
use nimbus_core::ports::remote_drive::{
    DeltaPage, DriveQuota, ItemPatch, RealtimeEndpoint, RemoteDrive, RemoteItem,
};
use nimbus_core::ports::TokenProvider;
use nimbus_core::NimbusError;

use crate::cache::ResponseCache;
use crate::error::{is_retryable, status_to_error};
use crate::offline::classify_transport_error;
use crate::types::{DriveDto, DriveItemDto, PageDto, SubscriptionDto};
use crate::upload::{SessionPersistence, SessionUploader};

/// Base URL for Microsoft Graph API v1.0.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Largest payload accepted by the single-request upload endpoint.
pub const SMALL_UPLOAD_MAX: u64 = 4 * 1024 * 1024;

/// Attempts per request before a transient failure surfaces.
const MAX_ATTEMPTS: u32 = 5;

/// Page size requested when listing children.
const CHILDREN_PAGE_SIZE: u32 = 200;

/// HTTP client for the Graph API.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    context: Arc<NimbusContext>,
    response_cache: ResponseCache,
    sessions: Option<Arc<dyn SessionPersistence>>,
}

impl GraphClient {
    /// Create a client against the production endpoint.
    pub fn new(tokens: Arc<dyn TokenProvider>, context: Arc<NimbusContext>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: GRAPH_BASE_URL.to_string(),
            tokens,
            context,
            response_cache: ResponseCache::new(),
            sessions: None,
        }
    }

    /// Create a client with a custom base URL (testing).
    pub fn with_base_url(
        tokens: Arc<dyn TokenProvider>,
        context: Arc<NimbusContext>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::new(tokens, context)
        }
    }

    /// Attach upload-session persistence so crashed session uploads
    /// resume from the last confirmed chunk.
    #[must_use]
    pub fn with_session_persistence(mut self, sessions: Arc<dyn SessionPersistence>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn context(&self) -> &Arc<NimbusContext> {
        &self.context
    }

    /// Send a request with auth, retry, and error mapping.
    ///
    /// `configure` is called per attempt so retried requests get a
    /// fresh builder (and a fresh token).
    pub(crate) async fn send<F>(
        &self,
        method: Method,
        url: &str,
        configure: F,
    ) -> Result<Response, NimbusError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        if self.context.operational_offline() {
            return Err(NimbusError::Offline("operational offline mode".to_string()));
        }

        let mut backoff = Backoff::network();
        let mut auth_retried = false;

        loop {
            let token = self.tokens.bearer_token().await?;
            let request = configure(self.http.request(method.clone(), url)).bearer_auth(token);

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = classify_transport_error(&self.context, &e);
                    if err.is_offline() || backoff.failures() + 1 >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    tracing::debug!(url, delay_ms = delay.as_millis() as u64, "Transport error, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED && !auth_retried {
                auth_retried = true;
                tracing::debug!(url, "401, invalidating token and retrying once");
                self.tokens.invalidate().await;
                continue;
            }

            if is_retryable(status) && backoff.failures() + 1 < MAX_ATTEMPTS {
                // A server-supplied Retry-After wins over our backoff.
                let delay = retry_after(&response)
                    .unwrap_or_else(|| backoff.next_delay());
                tracing::info!(
                    url,
                    %status,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable status, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body));
        }
    }

    /// GET a JSON document, optionally through the response cache.
    async fn get_json(
        &self,
        url: &str,
        cache_key: Option<String>,
    ) -> Result<serde_json::Value, NimbusError> {
        if let Some(key) = cache_key.as_deref() {
            if let Some(hit) = self.response_cache.get(key) {
                return Ok(hit);
            }
        }

        let response = self.send(Method::GET, url, |r| r).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("response parse: {e}")))?;

        if let Some(key) = cache_key {
            self.response_cache.put(key, value.clone());
        }
        Ok(value)
    }

    fn parse_item(value: serde_json::Value) -> Result<RemoteItem, NimbusError> {
        let dto: DriveItemDto = serde_json::from_value(value)
            .map_err(|e| NimbusError::Transient(format!("item parse: {e}")))?;
        dto.into_remote_item()
    }

    fn items_url(&self, id: &ItemId) -> String {
        format!("{}/me/drive/items/{}", self.base_url, id.as_str())
    }
}

/// Percent-encode one path segment the way the url crate would.
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut url = url::Url::parse("https://localhost/").expect("static url");
    url.path_segments_mut()
        .expect("https urls have segments")
        .push(segment);
    url.path()[1..].to_string()
}

/// Parse a `Retry-After: <seconds>` header.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ============================================================================
// RemoteDrive implementation
// ============================================================================

#[async_trait]
impl RemoteDrive for GraphClient {
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, NimbusError> {
        let url = self.items_url(id);
        let value = self
            .get_json(&url, Some(format!("item:{}", id.as_str())))
            .await?;
        Self::parse_item(value)
    }

    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, NimbusError> {
        let encoded: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(encode_segment)
            .collect();
        let url = format!(
            "{}/me/drive/root:/{}",
            self.base_url,
            encoded.join("/")
        );
        let value = self.get_json(&url, Some(format!("path:{path}"))).await?;
        Self::parse_item(value)
    }

    async fn get_root(&self) -> Result<RemoteItem, NimbusError> {
        let url = format!("{}/me/drive/root", self.base_url);
        let value = self.get_json(&url, Some("item:root".to_string())).await?;
        Self::parse_item(value)
    }

    async fn list_children(
        &self,
        id: &ItemId,
        next: Option<&str>,
    ) -> Result<(Vec<RemoteItem>, Option<String>), NimbusError> {
        let (url, cache_key) = match next {
            Some(link) => (link.to_string(), None),
            None => (
                format!(
                    "{}/children?$top={CHILDREN_PAGE_SIZE}",
                    self.items_url(id)
                ),
                Some(format!("children:{}", id.as_str())),
            ),
        };

        let value = self.get_json(&url, cache_key).await?;
        let page: PageDto = serde_json::from_value(value)
            .map_err(|e| NimbusError::Transient(format!("children parse: {e}")))?;
        let items = page
            .value
            .into_iter()
            .map(DriveItemDto::into_remote_item)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, page.next_link))
    }

    async fn download(
        &self,
        id: &ItemId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, NimbusError> {
        let url = format!("{}/content", self.items_url(id));
        let response = self.send(Method::GET, &url, |r| r).await?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_transport_error(&self.context, &e))?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        tracing::debug!(id = %id, written, "Downloaded content");
        Ok(written)
    }

    async fn patch_item(
        &self,
        id: &ItemId,
        patch: &ItemPatch,
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError> {
        let mut body = serde_json::Map::new();
        if let Some(name) = &patch.name {
            body.insert("name".to_string(), serde_json::json!(name));
        }
        if let Some(parent_id) = &patch.parent_id {
            body.insert(
                "parentReference".to_string(),
                serde_json::json!({ "id": parent_id.as_str() }),
            );
        }
        if let Some(mtime) = &patch.mtime {
            body.insert(
                "fileSystemInfo".to_string(),
                serde_json::json!({ "lastModifiedDateTime": mtime }),
            );
        }
        let body = serde_json::Value::Object(body);

        let url = self.items_url(id);
        let if_match = if_match.map(|e| e.as_str().to_string());
        let response = self
            .send(Method::PATCH, &url, move |r| {
                let r = r.json(&body);
                match &if_match {
                    Some(tag) => r.header("If-Match", tag),
                    None => r,
                }
            })
            .await?;

        self.response_cache.invalidate(id.as_str());
        let value = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("patch parse: {e}")))?;
        Self::parse_item(value)
    }

    async fn create_folder(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, NimbusError> {
        let url = format!("{}/children", self.items_url(parent_id));
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let response = self.send(Method::POST, &url, move |r| r.json(&body)).await?;
        self.response_cache.invalidate(parent_id.as_str());
        let value = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("folder parse: {e}")))?;
        Self::parse_item(value)
    }

    async fn upload_small(
        &self,
        parent_id: &ItemId,
        item_id: Option<&ItemId>,
        name: &str,
        data: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError> {
        let url = match item_id {
            Some(id) => format!("{}/content", self.items_url(id)),
            None => format!(
                "{}:/{}:/content",
                self.items_url(parent_id),
                encode_segment(name)
            ),
        };

        let payload = data.to_vec();
        let if_match = if_match.map(|e| e.as_str().to_string());
        let response = self
            .send(Method::PUT, &url, move |r| {
                let r = r
                    .header("Content-Type", "application/octet-stream")
                    .body(payload.clone());
                match &if_match {
                    Some(tag) => r.header("If-Match", tag),
                    None => r,
                }
            })
            .await?;

        self.response_cache.invalidate(parent_id.as_str());
        if let Some(id) = item_id {
            self.response_cache.invalidate(id.as_str());
        }

        let value = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("upload parse: {e}")))?;
        Self::parse_item(value)
    }

    async fn upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
        source: &std::path::Path,
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError> {
        let uploader = SessionUploader::new(self, self.sessions.clone());
        let item = uploader
            .upload(parent_id, name, source, if_match)
            .await?;
        self.response_cache.invalidate(parent_id.as_str());
        self.response_cache.invalidate(item.id.as_str());
        Ok(item)
    }

    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, NimbusError> {
        let url = match cursor {
            Some(c) => format!(
                "{}/me/drive/root/delta?token={}",
                self.base_url,
                c.as_str()
            ),
            None => format!("{}/me/drive/root/delta", self.base_url),
        };
        let value = self.get_json(&url, None).await?;
        let page: PageDto = serde_json::from_value(value)
            .map_err(|e| NimbusError::Transient(format!("delta parse: {e}")))?;
        page.into_delta_page()
    }

    async fn delta_next(&self, next_link: &str) -> Result<DeltaPage, NimbusError> {
        let value = self.get_json(next_link, None).await?;
        let page: PageDto = serde_json::from_value(value)
            .map_err(|e| NimbusError::Transient(format!("delta parse: {e}")))?;
        page.into_delta_page()
    }

    async fn remove(&self, id: &ItemId, if_match: Option<&ETag>) -> Result<(), NimbusError> {
        let url = self.items_url(id);
        let if_match = if_match.map(|e| e.as_str().to_string());
        self.send(Method::DELETE, &url, move |r| match &if_match {
            Some(tag) => r.header("If-Match", tag),
            None => r,
        })
        .await?;
        self.response_cache.invalidate(id.as_str());
        Ok(())
    }

    async fn subscribe(&self) -> Result<RealtimeEndpoint, NimbusError> {
        let url = format!("{}/me/drive/root/subscriptions/socketIo", self.base_url);
        let response = self.send(Method::GET, &url, |r| r).await?;
        let dto: SubscriptionDto = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("subscription parse: {e}")))?;
        Ok(RealtimeEndpoint {
            url: dto.notification_url,
            expires: dto.expiration_date_time,
        })
    }

    async fn quota(&self) -> Result<DriveQuota, NimbusError> {
        let url = format!("{}/me/drive", self.base_url);
        let value = self.get_json(&url, Some("drive:quota".to_string())).await?;
        let dto: DriveDto = serde_json::from_value(value)
            .map_err(|e| NimbusError::Transient(format!("drive parse: {e}")))?;
        let quota = dto.quota.unwrap_or(crate::types::QuotaDto {
            total: None,
            used: None,
        });
        Ok(DriveQuota {
            used: quota.used.unwrap_or(0),
            total: quota.total.unwrap_or(0),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
