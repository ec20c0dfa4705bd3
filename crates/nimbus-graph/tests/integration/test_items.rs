//! Item CRUD operations against the mock API.

use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nimbus_core::domain::newtypes::{ETag, ItemId};
use nimbus_core::ports::remote_drive::{ItemPatch, RemoteDrive};
use nimbus_core::NimbusError;

use crate::common::{client, file_json, folder_json};

fn id(s: &str) -> ItemId {
    ItemId::new(s.to_string()).unwrap()
}

#[tokio::test]
async fn test_get_item_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_json("A1", "doc.txt", 5, "\"v1\"")))
        .mount(&server)
        .await;

    let client = client(&server);
    let item = client.get_item(&id("A1")).await.unwrap();
    assert_eq!(item.name, "doc.txt");
    assert_eq!(item.size, 5);
    assert_eq!(item.etag.unwrap().as_str(), "\"v1\"");
    assert!(!item.is_directory);
}

#[tokio::test]
async fn test_get_item_404_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/GONE"))
        .respond_with(ResponseTemplate::new(404).set_body_string("{\"error\":{}}"))
        .mount(&server)
        .await;

    let err = client(&server).get_item(&id("GONE")).await.unwrap_err();
    assert!(matches!(err, NimbusError::NotFound(_)));
}

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_json("A1", "doc.txt", 5, "\"v1\"")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.get_item(&id("A1")).await.unwrap();
    // Second call hits the response cache; the mock's expect(1)
    // verifies no second request reached the server.
    client.get_item(&id("A1")).await.unwrap();
}

#[tokio::test]
async fn test_list_children_follows_pages() {
    let server = MockServer::start().await;
    let page2_url = format!("{}/me/drive/items/ROOT01/children?page=2", server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/items/ROOT01/children"))
        .and(query_param("$top", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_json("A1", "A", 1, "\"a\""), file_json("B1", "B", 2, "\"b\"")],
            "@odata.nextLink": page2_url,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/ROOT01/children"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [folder_json("C1", "C")],
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let (first, next) = client.list_children(&id("ROOT01"), None).await.unwrap();
    assert_eq!(first.len(), 2);
    let next = next.unwrap();

    let (second, done) = client.list_children(&id("ROOT01"), Some(&next)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(second[0].is_directory);
    assert!(done.is_none());
}

#[tokio::test]
async fn test_download_streams_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/A1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let mut sink: Vec<u8> = Vec::new();
    let written = client(&server).download(&id("A1"), &mut sink).await.unwrap();
    assert_eq!(written, 5);
    assert_eq!(sink, b"hello");
}

#[tokio::test]
async fn test_patch_rename_sends_if_match() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/me/drive/items/A1"))
        .and(header("If-Match", "\"v1\""))
        .and(body_partial_json(serde_json::json!({"name": "renamed.txt"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("A1", "renamed.txt", 5, "\"v2\"")),
        )
        .mount(&server)
        .await;

    let patch = ItemPatch {
        name: Some("renamed.txt".to_string()),
        ..Default::default()
    };
    let etag = ETag::new("\"v1\"".to_string()).unwrap();
    let item = client(&server)
        .patch_item(&id("A1"), &patch, Some(&etag))
        .await
        .unwrap();
    assert_eq!(item.name, "renamed.txt");
    assert_eq!(item.etag.unwrap().as_str(), "\"v2\"");
}

#[tokio::test]
async fn test_create_folder_conflict_is_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT01/children"))
        .respond_with(ResponseTemplate::new(409).set_body_string("{\"error\":{\"code\":\"nameAlreadyExists\"}}"))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_folder(&id("ROOT01"), "dup")
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_upload_small_creates_item_under_parent() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/ROOT01:/new.txt:/content"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(file_json("N1", "new.txt", 4, "\"n1\"")),
        )
        .mount(&server)
        .await;

    let item = client(&server)
        .upload_small(&id("ROOT01"), None, "new.txt", b"data", None)
        .await
        .unwrap();
    assert_eq!(item.id.as_str(), "N1");
}

#[tokio::test]
async fn test_upload_small_replace_hits_412() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/A1/content"))
        .and(header("If-Match", "\"stale\""))
        .respond_with(ResponseTemplate::new(412).set_body_string("{\"error\":{}}"))
        .mount(&server)
        .await;

    let etag = ETag::new("\"stale\"".to_string()).unwrap();
    let err = client(&server)
        .upload_small(&id("ROOT01"), Some(&id("A1")), "doc.txt", b"x", Some(&etag))
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_remove_sends_if_match() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/me/drive/items/A1"))
        .and(header("If-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let etag = ETag::new("\"v1\"".to_string()).unwrap();
    client(&server).remove(&id("A1"), Some(&etag)).await.unwrap();
}

#[tokio::test]
async fn test_quota() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "drive1",
            "quota": {"total": 5368709120u64, "used": 1073741824u64}
        })))
        .mount(&server)
        .await;

    let quota = client(&server).quota().await.unwrap();
    assert_eq!(quota.total, 5368709120);
    assert_eq!(quota.used, 1073741824);
}

#[tokio::test]
async fn test_subscribe_returns_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/subscriptions/socketIo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "notificationUrl": "https://pushchannel.1drv.ms/abc123",
            "expirationDateTime": "2026-03-15T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let endpoint = client(&server).subscribe().await.unwrap();
    assert_eq!(endpoint.url, "https://pushchannel.1drv.ms/abc123");
    assert!(endpoint.expires.is_some());
}
