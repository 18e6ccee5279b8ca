//! End-to-end tests for the service facade.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_app::{
    AppConfig, CaptureInput, DeleteOperation, FieldSync, OwnerRef, PhotoKind, PhotoStatus,
    RemoteStore, RemoteUpload, Result,
};
use fieldsync_db::test_fixtures::jpeg_bytes;
use fieldsync_jobs::{RunOutcome, SchedulerConfig};
use tempfile::TempDir;
use tokio_stream::StreamExt as _;

/// Accepts everything and keeps the upload key as the remote name.
#[derive(Default)]
struct AcceptAll {
    uploaded: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteStore for AcceptAll {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, upload: RemoteUpload) -> Result<String> {
        self.uploaded.lock().unwrap().push(upload.filename.clone());
        Ok(upload.filename)
    }

    async fn delete(&self, _tombstone: &DeleteOperation) -> Result<()> {
        Ok(())
    }
}

fn write_photo(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, jpeg_bytes(1024)).unwrap();
    path
}

fn offline_config(dir: &TempDir) -> AppConfig {
    AppConfig::new(dir.path().join("data"))
}

#[tokio::test]
async fn test_offline_capture_stays_queued() {
    let dir = tempfile::tempdir().unwrap();
    let app = FieldSync::open(offline_config(&dir)).await.unwrap();
    let owner = OwnerRef::schedule("sched-1");
    assert!(app.create_owner(&owner, "Boiler service").await.unwrap());

    let photo = write_photo(&dir, "IMG_0001.jpg");
    let attachment = app.stage(&photo, &owner, PhotoKind::Before).await.unwrap();

    let photos = app.photos(&owner).await.unwrap();
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].id, attachment.id);
    assert_eq!(photos[0].status, PhotoStatus::Pending);

    let status = app.status().await.unwrap();
    assert_eq!(status.pending, 1);
    assert!(!status.is_running);

    let outcome = app.sync_now().await;
    assert!(matches!(outcome, RunOutcome::Failed { ref error } if error.contains("no remote service")));
    assert_eq!(app.status().await.unwrap().pending, 1);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let owner = OwnerRef::invoice("inv-3");
    let local = {
        let app = FieldSync::open(offline_config(&dir)).await.unwrap();
        app.create_owner(&owner, "").await.unwrap();
        let photo = write_photo(&dir, "IMG_0002.jpg");
        let attachment = app.stage(&photo, &owner, PhotoKind::After).await.unwrap();
        std::fs::remove_file(&photo).unwrap();
        app.shutdown().await.unwrap();
        attachment.local_path.unwrap()
    };

    let app = FieldSync::open(offline_config(&dir)).await.unwrap();
    assert_eq!(app.status().await.unwrap().pending, 1);
    assert_eq!(app.attachments(&owner).await.unwrap().len(), 1);
    assert!(local.exists());
}

#[tokio::test]
async fn test_capture_uploads_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(AcceptAll::default());
    let config = offline_config(&dir).with_scheduler(SchedulerConfig::default().with_interval(10));
    let app = FieldSync::open_with_remote(config, Some(remote.clone()))
        .await
        .unwrap();
    let owner = OwnerRef::schedule("sched-1");
    app.create_owner(&owner, "").await.unwrap();

    let statuses = app.status_stream();
    tokio::pin!(statuses);

    let photo = write_photo(&dir, "IMG_0003.jpg");
    let attachment = app.stage(&photo, &owner, PhotoKind::Before).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        // The startup run may report an empty queue before the capture lands.
        while let Some(status) = statuses.next().await {
            if status.pending == 0 && !status.is_running {
                let photos = app.photos(&owner).await.unwrap();
                if photos[0].status == PhotoStatus::Uploaded {
                    break;
                }
            }
        }
    })
    .await
    .expect("upload did not finish");

    let photos = app.photos(&owner).await.unwrap();
    assert_eq!(photos[0].status, PhotoStatus::Uploaded);
    assert_eq!(remote.uploaded.lock().unwrap().clone(), vec![attachment.filename]);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_and_delete_through_facade() {
    let dir = tempfile::tempdir().unwrap();
    let app = FieldSync::open(offline_config(&dir).with_max_capture_bytes(2048))
        .await
        .unwrap();
    let owner = OwnerRef::schedule("sched-2");
    app.create_owner(&owner, "").await.unwrap();

    let big = dir.path().join("big.jpg");
    std::fs::write(&big, jpeg_bytes(4096)).unwrap();
    let inputs = vec![
        CaptureInput::new(write_photo(&dir, "a.jpg"), PhotoKind::Before),
        CaptureInput::new(big, PhotoKind::Before),
        CaptureInput::new(write_photo(&dir, "b.jpg"), PhotoKind::After),
    ];
    let outcome = app.stage_batch(&owner, &inputs).await.unwrap();
    assert_eq!(outcome.staged_count(), 2);
    assert_eq!(outcome.rejected_count(), 1);

    let deleted = app
        .request_delete(&owner, outcome.staged[0].id, None)
        .await
        .unwrap();
    assert!(deleted.tombstone_written);
    assert!(deleted.binary_released);

    let photos = app.photos(&owner).await.unwrap();
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].id, outcome.staged[1].id);
    assert_eq!(app.status().await.unwrap().pending, 1);
}
