//! Retry, 429 handling, and auth-refresh behavior.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nimbus_core::context::NimbusContext;
use nimbus_core::domain::newtypes::ItemId;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::ports::TokenProvider;
use nimbus_core::NimbusError;
use nimbus_graph::GraphClient;

use crate::common::{client, file_json};

fn id(s: &str) -> ItemId {
    ItemId::new(s.to_string()).unwrap()
}

#[tokio::test]
async fn test_429_retries_after_server_delay() {
    let server = MockServer::start().await;

    // First response throttles with an immediate Retry-After, the
    // mock then falls through to the success response.
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_string("{\"error\":{\"code\":\"activityLimitReached\"}}"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_json("A1", "a.txt", 1, "\"a\"")))
        .mount(&server)
        .await;

    let item = client(&server).get_item(&id("A1")).await.unwrap();
    assert_eq!(item.name, "a.txt");
}

#[tokio::test]
async fn test_404_does_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).get_item(&id("A1")).await.unwrap_err();
    assert!(matches!(err, NimbusError::NotFound(_)));
}

/// Provider that rotates to a fresh token when invalidated.
struct RotatingTokens {
    invalidations: AtomicU32,
}

#[async_trait]
impl TokenProvider for RotatingTokens {
    async fn bearer_token(&self) -> Result<String, NimbusError> {
        if self.invalidations.load(Ordering::SeqCst) == 0 {
            Ok("stale-token".to_string())
        } else {
            Ok("fresh-token".to_string())
        }
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_401_invalidates_token_and_retries_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .and(header("Authorization", "Bearer stale-token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{}"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .and(header("Authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_json("A1", "a.txt", 1, "\"a\"")))
        .mount(&server)
        .await;

    let provider = std::sync::Arc::new(RotatingTokens {
        invalidations: AtomicU32::new(0),
    });
    let client = GraphClient::with_base_url(
        provider.clone(),
        NimbusContext::new(false),
        server.uri(),
    );

    let item = client.get_item(&id("A1")).await.unwrap();
    assert_eq!(item.name, "a.txt");
    assert_eq!(provider.invalidations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_401_surfaces_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{}"))
        .mount(&server)
        .await;

    let err = client(&server).get_item(&id("A1")).await.unwrap_err();
    assert!(matches!(err, NimbusError::AuthExpired));
}
