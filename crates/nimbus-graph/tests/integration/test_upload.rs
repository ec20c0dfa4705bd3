//! Upload session flow: creation, chunking, resume, and 412.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nimbus_core::domain::newtypes::{ETag, ItemId};
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::NimbusError;
use nimbus_graph::upload::{PersistedSession, SessionPersistence};
use nimbus_graph::GraphClient;

use crate::common::{client, file_json};

fn id(s: &str) -> ItemId {
    ItemId::new(s.to_string()).unwrap()
}

/// In-memory session persistence for tests.
#[derive(Default)]
struct MemorySessions {
    map: DashMap<String, PersistedSession>,
}

#[async_trait]
impl SessionPersistence for MemorySessions {
    async fn load(&self, parent_id: &ItemId, name: &str) -> Option<PersistedSession> {
        self.map
            .get(&format!("{}/{name}", parent_id.as_str()))
            .map(|e| e.clone())
    }

    async fn save(&self, parent_id: &ItemId, name: &str, session: &PersistedSession) {
        self.map
            .insert(format!("{}/{name}", parent_id.as_str()), session.clone());
    }

    async fn clear(&self, parent_id: &ItemId, name: &str) {
        self.map.remove(&format!("{}/{name}", parent_id.as_str()));
    }
}

#[tokio::test]
async fn test_session_upload_single_chunk_completes() {
    let server = MockServer::start().await;
    let upload_url = format!("{}/upload-session/1", server.uri());

    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT01:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": upload_url,
            "expirationDateTime": "2026-03-15T00:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-session/1"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(file_json("BIG1", "big.bin", 6, "\"u1\"")),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, b"6bytes").unwrap();

    let item = client(&server)
        .upload_session(&id("ROOT01"), "big.bin", &source, None)
        .await
        .unwrap();
    assert_eq!(item.id.as_str(), "BIG1");
}

#[tokio::test]
async fn test_session_create_passes_if_match_and_412_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT01:/big.bin:/createUploadSession"))
        .and(header("If-Match", "\"stale\""))
        .respond_with(ResponseTemplate::new(412).set_body_string("{}"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, b"data").unwrap();

    let etag = ETag::new("\"stale\"".to_string()).unwrap();
    let err = client(&server)
        .upload_session(&id("ROOT01"), "big.bin", &source, Some(&etag))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_session_resume_skips_confirmed_bytes() {
    let server = MockServer::start().await;
    let upload_url = format!("{}/upload-session/resume", server.uri());

    // The server reports byte 3 as the resume point...
    Mock::given(method("GET"))
        .and(path("/upload-session/resume"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["3-5"]
        })))
        .mount(&server)
        .await;
    // ...and the PUT of the remaining range finishes the session.
    Mock::given(method("PUT"))
        .and(path("/upload-session/resume"))
        .and(header("Content-Range", "bytes 3-5/6"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("BIG1", "big.bin", 6, "\"u2\"")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, b"6bytes").unwrap();

    let sessions = Arc::new(MemorySessions::default());
    sessions
        .save(
            &id("ROOT01"),
            "big.bin",
            &PersistedSession {
                upload_url,
                total_size: 6,
                bytes_confirmed: 3,
            },
        )
        .await;

    let client = GraphClient::with_base_url(
        Arc::new(crate::common::StaticTokens("test-token")),
        nimbus_core::context::NimbusContext::new(false),
        server.uri(),
    )
    .with_session_persistence(sessions.clone());

    let item = client
        .upload_session(&id("ROOT01"), "big.bin", &source, None)
        .await
        .unwrap();
    assert_eq!(item.id.as_str(), "BIG1");
    // Completion clears the persisted session.
    assert!(sessions.load(&id("ROOT01"), "big.bin").await.is_none());
}

#[tokio::test]
async fn test_stale_session_for_changed_file_is_discarded() {
    let server = MockServer::start().await;
    let upload_url = format!("{}/upload-session/new", server.uri());

    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT01:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": upload_url,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-session/new"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(file_json("BIG2", "big.bin", 8, "\"u3\"")),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, b"8--bytes").unwrap();

    // Persisted session was for a 6-byte file; it must be ignored.
    let sessions = Arc::new(MemorySessions::default());
    sessions
        .save(
            &id("ROOT01"),
            "big.bin",
            &PersistedSession {
                upload_url: "https://stale.example/never-called".to_string(),
                total_size: 6,
                bytes_confirmed: 3,
            },
        )
        .await;

    let client = GraphClient::with_base_url(
        Arc::new(crate::common::StaticTokens("test-token")),
        nimbus_core::context::NimbusContext::new(false),
        server.uri(),
    )
    .with_session_persistence(sessions);

    let item = client
        .upload_session(&id("ROOT01"), "big.bin", &source, None)
        .await
        .unwrap();
    assert_eq!(item.id.as_str(), "BIG2");
}
