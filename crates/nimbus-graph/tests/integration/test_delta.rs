//! Delta paging against the mock API.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nimbus_core::domain::newtypes::DeltaCursor;
use nimbus_core::ports::remote_drive::RemoteDrive;

use crate::common::{client, file_json, folder_json};

#[tokio::test]
async fn test_initial_delta_pages_to_cursor() {
    let server = MockServer::start().await;
    let page2 = format!("{}/me/drive/root/delta?token=page2", server.uri());
    let delta_link = format!("{}/me/drive/root/delta?token=final-cursor", server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_json("B1", "b.txt", 2, "\"b\"")],
            "@odata.deltaLink": delta_link,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                {"id": "ROOT01", "name": "root", "root": {}, "folder": {}},
                folder_json("D1", "docs"),
                file_json("A1", "a.txt", 1, "\"a\""),
            ],
            "@odata.nextLink": page2,
        })))
        .mount(&server)
        .await;

    let client = client(&server);

    let first = client.delta(None).await.unwrap();
    assert_eq!(first.items.len(), 3);
    assert!(first.items[0].is_root);
    assert!(first.cursor.is_none());
    let next = first.next_link.unwrap();

    let second = client.delta_next(&next).await.unwrap();
    assert_eq!(second.items.len(), 1);
    assert!(second.next_link.is_none());
    assert_eq!(second.cursor.unwrap().as_str(), "final-cursor");
}

#[tokio::test]
async fn test_incremental_delta_sends_cursor() {
    let server = MockServer::start().await;
    let delta_link = format!("{}/me/drive/root/delta?token=cursor-2", server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "cursor-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [],
            "@odata.deltaLink": delta_link,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cursor = DeltaCursor::new("cursor-1".to_string()).unwrap();
    let page = client(&server).delta(Some(&cursor)).await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.cursor.unwrap().as_str(), "cursor-2");
}

#[tokio::test]
async fn test_delta_reports_deletions() {
    let server = MockServer::start().await;
    let delta_link = format!("{}/me/drive/root/delta?token=c3", server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                {"id": "A1", "name": "a.txt", "deleted": {"state": "deleted"}, "file": {}}
            ],
            "@odata.deltaLink": delta_link,
        })))
        .mount(&server)
        .await;

    let page = client(&server).delta(None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(page.items[0].is_deleted);
}
