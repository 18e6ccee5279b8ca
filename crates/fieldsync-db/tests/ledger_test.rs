//! Integration tests for attachment ledger transitions.

use fieldsync_db::test_fixtures::TestStore;
use fieldsync_db::{Attachment, AttachmentState, OwnerRef, PhotoKind, PhotoStatus, Transition};

const MAX: u64 = 1024 * 1024;

async fn staged(store: &TestStore, owner: &OwnerRef, name: &str) -> Attachment {
    let source = store.write_jpeg(name);
    store
        .capture()
        .stage(&source, owner, PhotoKind::Before, MAX)
        .await
        .expect("stage failed")
}

#[tokio::test]
async fn test_begin_upload_only_once() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;

    let ledger = &store.db.attachments;
    assert_eq!(ledger.begin_upload(a.id).await.unwrap(), Transition::Applied);
    assert_eq!(ledger.begin_upload(a.id).await.unwrap(), Transition::Unchanged);
    assert_eq!(
        ledger.begin_upload(uuid::Uuid::now_v7()).await.unwrap(),
        Transition::Missing
    );
    assert_eq!(ledger.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn test_mark_synced_updates_photo_entry() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let ledger = &store.db.attachments;

    ledger.begin_upload(a.id).await.unwrap();
    assert_eq!(
        ledger.mark_synced(a.id, "remote/abc.jpg").await.unwrap(),
        Transition::Applied
    );

    let row = ledger.get(a.id).await.unwrap().unwrap();
    assert_eq!(row.state, AttachmentState::Synced);
    assert_eq!(row.remote_filename.as_deref(), Some("remote/abc.jpg"));
    assert_eq!(row.remote_reference(), "remote/abc.jpg");

    let photos = store.db.owners.photos(&owner).await.unwrap();
    assert_eq!(photos[0].status, PhotoStatus::Uploaded);
    assert_eq!(photos[0].url_or_filename, "remote/abc.jpg");
}

#[tokio::test]
async fn test_second_mark_synced_is_a_noop() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let ledger = &store.db.attachments;

    ledger.mark_synced(a.id, "first.jpg").await.unwrap();
    let before = ledger.get(a.id).await.unwrap().unwrap();

    assert_eq!(
        ledger.mark_synced(a.id, "second.jpg").await.unwrap(),
        Transition::Unchanged
    );
    let after = ledger.get(a.id).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.remote_filename.as_deref(), Some("first.jpg"));
    assert_eq!(
        store.db.owners.photos(&owner).await.unwrap()[0].url_or_filename,
        "first.jpg"
    );
}

#[tokio::test]
async fn test_synced_row_cannot_fail() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let ledger = &store.db.attachments;

    ledger.mark_synced(a.id, "x.jpg").await.unwrap();
    assert_eq!(
        ledger.mark_failed(a.id, "late error").await.unwrap(),
        Transition::Rejected(AttachmentState::Synced)
    );
}

#[tokio::test]
async fn test_failure_then_requeue() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let ledger = &store.db.attachments;

    ledger.begin_upload(a.id).await.unwrap();
    assert!(ledger.mark_failed(a.id, "HTTP 500").await.unwrap().is_applied());

    let row = ledger.get(a.id).await.unwrap().unwrap();
    assert_eq!(row.state, AttachmentState::Failed);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("HTTP 500"));
    assert_eq!(
        store.db.owners.photos(&owner).await.unwrap()[0].status,
        PhotoStatus::Failed
    );
    assert_eq!(ledger.count_by_state(AttachmentState::Failed).await.unwrap(), 1);

    assert_eq!(ledger.requeue_failed().await.unwrap(), 1);
    let row = ledger.get(a.id).await.unwrap().unwrap();
    assert_eq!(row.state, AttachmentState::QueuedUpload);
    assert_eq!(row.retry_count, 1);
    assert_eq!(
        store.db.owners.photos(&owner).await.unwrap()[0].status,
        PhotoStatus::Pending
    );
}

#[tokio::test]
async fn test_failed_rows_of_deleted_owner_stay_failed() {
    let store = TestStore::new().await;
    let kept = store.schedule("sched-1").await;
    let dropped = store.invoice("inv-1").await;
    let a = staged(&store, &kept, "a.jpg").await;
    let b = staged(&store, &dropped, "b.jpg").await;
    let ledger = &store.db.attachments;

    ledger.mark_failed(a.id, "boom").await.unwrap();
    ledger.mark_failed(b.id, "boom").await.unwrap();
    store.db.owners.delete(&dropped).await.unwrap();

    assert_eq!(ledger.requeue_failed().await.unwrap(), 1);
    assert_eq!(
        ledger.get(b.id).await.unwrap().unwrap().state,
        AttachmentState::Failed
    );
}

#[tokio::test]
async fn test_recover_interrupted_uploads() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let b = staged(&store, &owner, "b.jpg").await;
    let ledger = &store.db.attachments;

    ledger.begin_upload(a.id).await.unwrap();
    ledger.begin_upload(b.id).await.unwrap();
    assert_eq!(ledger.count_by_state(AttachmentState::Uploading).await.unwrap(), 2);

    assert_eq!(ledger.recover_interrupted().await.unwrap(), 2);
    assert_eq!(ledger.count_by_state(AttachmentState::QueuedUpload).await.unwrap(), 2);
    assert_eq!(ledger.recover_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn test_revert_upload_keeps_retry_count() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let a = staged(&store, &owner, "a.jpg").await;
    let ledger = &store.db.attachments;

    assert_eq!(ledger.revert_upload(a.id).await.unwrap(), Transition::Unchanged);
    ledger.begin_upload(a.id).await.unwrap();
    assert_eq!(ledger.revert_upload(a.id).await.unwrap(), Transition::Applied);

    let row = ledger.get(a.id).await.unwrap().unwrap();
    assert_eq!(row.state, AttachmentState::QueuedUpload);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn test_list_by_state_oldest_first() {
    let store = TestStore::new().await;
    let owner = store.schedule("sched-1").await;
    let first = staged(&store, &owner, "1.jpg").await;
    let second = staged(&store, &owner, "2.jpg").await;

    let queued = store
        .db
        .attachments
        .list_by_state(AttachmentState::QueuedUpload, 10)
        .await
        .unwrap();
    let ids: Vec<_> = queued.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}
