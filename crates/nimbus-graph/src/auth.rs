//! Token storage and refresh.
//!
//! The adapter consumes bearer tokens through the [`TokenProvider`]
//! port. The production implementation here keeps tokens in an
//! owner-only JSON file under the per-account cache directory
//! (`accounts/<sha256(email)>/auth.json`) and refreshes them against
//! the OAuth2 token endpoint when they expire. The interactive
//! browser flow that first obtains tokens is the embedder's job; this
//! code only ever sees a refresh token.
//!
//! Older releases kept the token file beside the per-mount cache; on
//! first open the legacy file is migrated copy-then-verify and the
//! original is preserved.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use nimbus_core::config::Config;
use nimbus_core::context::NimbusContext;
use nimbus_core::ports::TokenProvider;
use nimbus_core::NimbusError;

use crate::offline::classify_transport_error;

/// Default OAuth2 token endpoint.
const TOKEN_ENDPOINT: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Scopes requested on refresh.
const SCOPES: &str = "files.readwrite.all offline_access";

/// Refresh this long before the nominal expiry.
const EXPIRY_MARGIN_SECONDS: i64 = 120;

/// Token file name inside the account directory.
const TOKEN_FILE: &str = "auth.json";

// ============================================================================
// Tokens
// ============================================================================

/// OAuth tokens as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Bearer token for API requests.
    pub access_token: String,
    /// Token for refreshing without user interaction.
    pub refresh_token: Option<String>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Returns true if the access token has expired (with margin).
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECONDS) >= self.expires_at
    }
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

// ============================================================================
// FileTokenProvider
// ============================================================================

/// File-backed token provider with refresh.
pub struct FileTokenProvider {
    http: reqwest::Client,
    context: std::sync::Arc<NimbusContext>,
    token_endpoint: String,
    client_id: String,
    path: PathBuf,
    legacy_path: Option<PathBuf>,
    /// Cached tokens; the mutex also single-flights refreshes so
    /// concurrent 401s trigger one refresh, not a stampede.
    cached: Mutex<Option<Tokens>>,
}

impl FileTokenProvider {
    /// Provider for `account_email`, storing tokens under the
    /// per-account cache directory. `legacy_path` points at the old
    /// mount-local token file to migrate from, if any.
    pub fn new(
        context: std::sync::Arc<NimbusContext>,
        account_email: &str,
        client_id: impl Into<String>,
        legacy_path: Option<PathBuf>,
    ) -> Self {
        let path = Config::account_dir(account_email).join(TOKEN_FILE);
        Self::with_paths(context, client_id, path, legacy_path)
    }

    /// Fully parameterized constructor (tests use temp paths and a
    /// wiremock token endpoint).
    pub fn with_paths(
        context: std::sync::Arc<NimbusContext>,
        client_id: impl Into<String>,
        path: PathBuf,
        legacy_path: Option<PathBuf>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            context,
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            client_id: client_id.into(),
            path,
            legacy_path,
            cached: Mutex::new(None),
        }
    }

    /// Override the token endpoint (testing).
    #[must_use]
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Where the token file lives.
    #[must_use]
    pub fn token_path(&self) -> &Path {
        &self.path
    }

    /// Persist freshly obtained tokens (e.g. after the embedder's
    /// interactive flow) and prime the cache.
    pub async fn store_tokens(&self, tokens: Tokens) -> Result<(), NimbusError> {
        write_token_file(&self.path, &tokens)?;
        *self.cached.lock().await = Some(tokens);
        Ok(())
    }

    /// Load the token file, migrating from the legacy location when
    /// the new path is absent. The legacy file is copied, the copy
    /// parsed back to verify it, and the original left in place.
    fn load_from_disk(&self) -> Result<Option<Tokens>, NimbusError> {
        if !self.path.exists() {
            let Some(legacy) = self.legacy_path.as_ref().filter(|p| p.exists()) else {
                return Ok(None);
            };

            tracing::info!(
                from = %legacy.display(),
                to = %self.path.display(),
                "Migrating auth tokens from legacy location"
            );
            let raw = std::fs::read_to_string(legacy)?;
            let tokens: Tokens = serde_json::from_str(&raw).map_err(|e| {
                NimbusError::AuthFailed(format!("legacy token file is unreadable: {e}"))
            })?;
            write_token_file(&self.path, &tokens)?;
            // Verify the copy before trusting it.
            let written = std::fs::read_to_string(&self.path)?;
            let _: Tokens = serde_json::from_str(&written).map_err(|e| {
                NimbusError::AuthFailed(format!("migrated token file failed verification: {e}"))
            })?;
            return Ok(Some(tokens));
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let tokens = serde_json::from_str(&raw)
            .map_err(|e| NimbusError::AuthFailed(format!("token file is unreadable: {e}")))?;
        Ok(Some(tokens))
    }

    /// Exchange the refresh token for fresh tokens.
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens, NimbusError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", SCOPES),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.context, &e))?;

        let status = response.status();
        if status.is_client_error() {
            // The refresh token was revoked or the grant is invalid:
            // only interactive re-authentication can recover.
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "Token refresh rejected");
            return Err(NimbusError::AuthFailed(format!(
                "refresh rejected with {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(NimbusError::Transient(format!(
                "token endpoint returned {status}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| NimbusError::Transient(format!("token response parse: {e}")))?;

        let tokens = Tokens {
            access_token: parsed.access_token,
            // The endpoint may rotate the refresh token; keep the old
            // one when it does not.
            refresh_token: parsed
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        };
        write_token_file(&self.path, &tokens)?;
        tracing::info!("Access token refreshed");
        Ok(tokens)
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn bearer_token(&self) -> Result<String, NimbusError> {
        let mut cached = self.cached.lock().await;

        if cached.is_none() {
            *cached = self.load_from_disk()?;
        }

        match cached.as_ref() {
            Some(tokens) if !tokens.is_expired() => Ok(tokens.access_token.clone()),
            Some(tokens) => {
                let Some(refresh_token) = tokens.refresh_token.clone() else {
                    return Err(NimbusError::AuthFailed(
                        "access token expired and no refresh token is available".to_string(),
                    ));
                };
                let fresh = self.refresh(&refresh_token).await?;
                let access = fresh.access_token.clone();
                *cached = Some(fresh);
                Ok(access)
            }
            None => Err(NimbusError::AuthFailed(format!(
                "no tokens at {}; run the authentication flow first",
                self.path.display()
            ))),
        }
    }

    async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if let Some(tokens) = cached.as_mut() {
            // Force the next bearer_token() call through refresh.
            tokens.expires_at = Utc::now();
        }
    }
}

/// Write the token file with owner-only permissions, creating parents.
fn write_token_file(path: &Path, tokens: &Tokens) -> Result<(), NimbusError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(tokens)
        .map_err(|e| NimbusError::AuthFailed(format!("token encode: {e}")))?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
