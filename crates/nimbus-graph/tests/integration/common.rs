//! Shared helpers for the Graph integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use wiremock::MockServer;

use nimbus_core::context::NimbusContext;
use nimbus_core::ports::TokenProvider;
use nimbus_core::NimbusError;
use nimbus_graph::GraphClient;

/// Token provider returning a fixed token.
pub struct StaticTokens(pub &'static str);

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn bearer_token(&self) -> Result<String, NimbusError> {
        Ok(self.0.to_string())
    }

    async fn invalidate(&self) {}
}

/// A client pointed at the mock server.
pub fn client(server: &MockServer) -> GraphClient {
    GraphClient::with_base_url(
        Arc::new(StaticTokens("test-token")),
        NimbusContext::new(false),
        server.uri(),
    )
}

/// JSON for a simple remote file.
pub fn file_json(id: &str, name: &str, size: u64, etag: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": etag,
        "lastModifiedDateTime": "2026-03-14T09:26:53Z",
        "parentReference": {"id": "ROOT01"},
        "file": {"hashes": {"quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA="}}
    })
}

/// JSON for a remote folder.
pub fn folder_json(id: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "eTag": "\"d1\"",
        "parentReference": {"id": "ROOT01"},
        "folder": {"childCount": 0}
    })
}
