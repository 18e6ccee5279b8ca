//! Integration tests for the HTTP remote store against a mock service.

use std::sync::Arc;

use chrono::Utc;
use fieldsync_db::test_fixtures::TestStore;
use fieldsync_db::{
    AttachmentState, DeleteOperation, Error, OwnerRef, PhotoKind, RemoteStore, RemoteUpload,
    SyncPrimitive,
};
use fieldsync_jobs::{AttachmentSyncPass, HttpRemoteConfig, HttpRemoteStore};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote(server: &MockServer) -> HttpRemoteStore {
    HttpRemoteStore::new(HttpRemoteConfig::new(server.uri()).with_token("secret"))
        .expect("Failed to create remote store")
}

fn upload(filename: &str) -> RemoteUpload {
    RemoteUpload {
        attachment_id: Uuid::now_v7(),
        owner_id: "sched-1".to_string(),
        photo_kind: PhotoKind::Before,
        filename: filename.to_string(),
        content_type: "image/jpeg".to_string(),
        content_hash: "blake3:00".to_string(),
        data: vec![0xFF, 0xD8, 0xFF, 0xE0],
    }
}

fn tombstone(reference: &str) -> DeleteOperation {
    DeleteOperation {
        id: Uuid::now_v7(),
        owner: OwnerRef::schedule("sched-1"),
        attachment_id: Uuid::now_v7(),
        remote_reference: reference.to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_upload_returns_assigned_filename() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/attachments/a.jpg"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({ "filename": "2026/10/a.jpg" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let assigned = remote(&server).upload(upload("a.jpg")).await.unwrap();
    assert_eq!(assigned, "2026/10/a.jpg");
}

#[tokio::test]
async fn test_upload_without_body_keeps_key() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/attachments/b.png"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let assigned = remote(&server).upload(upload("b.png")).await.unwrap();
    assert_eq!(assigned, "b.png");
}

#[tokio::test]
async fn test_upload_error_classes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/attachments/busy.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/attachments/bad.jpg"))
        .respond_with(ResponseTemplate::new(422).set_body_string("not an image"))
        .mount(&server)
        .await;

    let store = remote(&server);
    let busy = store.upload(upload("busy.jpg")).await.unwrap_err();
    assert!(busy.is_transient());

    let bad = store.upload(upload("bad.jpg")).await.unwrap_err();
    assert!(!bad.is_transient());
    assert!(bad.to_string().contains("not an image"));
}

#[tokio::test]
async fn test_delete_of_missing_remote_copy_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/attachments/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    remote(&server).delete(&tombstone("gone.jpg")).await.unwrap();
}

#[tokio::test]
async fn test_probe_failure_is_sync_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = remote(&server).probe().await.unwrap_err();
    assert!(matches!(err, Error::Sync(_)));
}

#[tokio::test]
async fn test_unreachable_service_is_transient() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let store = HttpRemoteStore::new(HttpRemoteConfig::new(uri).with_timeout_secs(2)).unwrap();
    let err = store.upload(upload("a.jpg")).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_sync_pass_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let source = store.write_jpeg("IMG_0001.jpg");
    let staged = store
        .capture()
        .stage(&source, &owner, PhotoKind::After, 1024 * 1024)
        .await
        .unwrap();

    Mock::given(method("PUT"))
        .and(path(format!("/attachments/{}", staged.filename)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "filename": "cdn/after.jpg" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let pass = AttachmentSyncPass::new(
        store.db.clone(),
        store.storage.clone(),
        Arc::new(remote(&server)),
    );
    let report = pass.sync_pending().await.unwrap();

    assert_eq!(report.uploaded, 1);
    let row = store.db.attachments.get(staged.id).await.unwrap().unwrap();
    assert_eq!(row.state, AttachmentState::Synced);
    assert_eq!(row.remote_filename.as_deref(), Some("cdn/after.jpg"));
}
