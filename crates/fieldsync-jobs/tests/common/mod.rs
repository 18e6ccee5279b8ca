//! Shared stubs for the upload scheduler and sync pass tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Semaphore};

use fieldsync_db::test_fixtures::TestStore;
use fieldsync_db::{
    Attachment, AttachmentState, Database, DeleteOperation, Error, OwnerRef, PhotoKind,
    RemoteStore, RemoteUpload, Result, SyncPrimitive, SyncReport, Transition,
};
use fieldsync_jobs::SchedulerEvent;

pub const MAX: u64 = 1024 * 1024;

/// Stage `count` JPEGs for `owner`.
pub async fn stage_many(store: &TestStore, owner: &OwnerRef, count: usize) -> Vec<Attachment> {
    let capture = store.capture();
    let mut staged = Vec::with_capacity(count);
    for i in 0..count {
        let source = store.write_jpeg(&format!("IMG_{i:04}.jpg"));
        staged.push(
            capture
                .stage(&source, owner, PhotoKind::Before, MAX)
                .await
                .expect("stage failed"),
        );
    }
    staged
}

/// In-memory remote service. Assigns `remote/{filename}` to every upload.
#[derive(Default)]
pub struct MemoryRemote {
    pub uploaded: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    probe_failures: AtomicU32,
    transient_uploads: AtomicU32,
    refused_uploads: AtomicU32,
    rejected_uploads: Mutex<HashSet<String>>,
    rejected_deletes: Mutex<HashSet<String>>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` probes as if the network were down.
    pub fn fail_probes(&self, n: u32) {
        self.probe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` uploads with a transient transport error.
    pub fn fail_uploads_transiently(&self, n: u32) {
        self.transient_uploads.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` uploads with a permanent error.
    pub fn refuse_uploads(&self, n: u32) {
        self.refused_uploads.store(n, Ordering::SeqCst);
    }

    /// Refuse uploads of `filename` with a permanent error.
    pub fn reject_upload(&self, filename: &str) {
        self.rejected_uploads.lock().unwrap().insert(filename.to_string());
    }

    /// Refuse deletes of `reference` with a permanent error.
    pub fn reject_delete(&self, reference: &str) {
        self.rejected_deletes.lock().unwrap().insert(reference.to_string());
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn probe(&self) -> Result<()> {
        if take_one(&self.probe_failures) {
            return Err(Error::Request("connection refused".into()));
        }
        Ok(())
    }

    async fn upload(&self, upload: RemoteUpload) -> Result<String> {
        if take_one(&self.transient_uploads) {
            return Err(Error::Request("connection reset".into()));
        }
        if take_one(&self.refused_uploads)
            || self.rejected_uploads.lock().unwrap().contains(&upload.filename)
        {
            return Err(Error::InvalidInput(format!("upload returned 422: {}", upload.filename)));
        }
        self.uploaded.lock().unwrap().push(upload.filename.clone());
        Ok(format!("remote/{}", upload.filename))
    }

    async fn delete(&self, tombstone: &DeleteOperation) -> Result<()> {
        if self
            .rejected_deletes
            .lock()
            .unwrap()
            .contains(&tombstone.remote_reference)
        {
            return Err(Error::InvalidInput("delete returned 403".into()));
        }
        self.deleted
            .lock()
            .unwrap()
            .push(tombstone.remote_reference.clone());
        Ok(())
    }
}

/// Uploads exactly one queued row per call, so a run takes one iteration
/// per staged photo.
pub struct OneAtATime {
    db: Database,
    gate: Option<Arc<Semaphore>>,
}

impl OneAtATime {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self { db, gate: None })
    }

    /// Each call waits for a permit on `gate` first.
    pub fn gated(db: Database, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            db,
            gate: Some(gate),
        })
    }
}

#[async_trait]
impl SyncPrimitive for OneAtATime {
    async fn sync_pending(&self) -> Result<SyncReport> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let mut report = SyncReport::default();
        let queued = self
            .db
            .attachments
            .list_by_state(AttachmentState::QueuedUpload, 1)
            .await?;
        if let Some(row) = queued.first() {
            if self.db.attachments.begin_upload(row.id).await? == Transition::Applied {
                self.db
                    .attachments
                    .mark_synced(row.id, &format!("remote/{}", row.filename))
                    .await?;
                report.uploaded = 1;
            }
        }
        Ok(report)
    }
}

/// Fails the first `n` calls as a whole, then delegates.
pub struct Flaky {
    failures: AtomicU32,
    pub calls: AtomicU32,
    inner: Arc<dyn SyncPrimitive>,
}

impl Flaky {
    pub fn new(failures: u32, inner: Arc<dyn SyncPrimitive>) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            inner,
        })
    }
}

#[async_trait]
impl SyncPrimitive for Flaky {
    async fn sync_pending(&self) -> Result<SyncReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(Error::Sync("network unreachable".into()));
        }
        self.inner.sync_pending().await
    }
}

/// Receive events until one matches, skipping the rest.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    mut matches: F,
) -> SchedulerEvent
where
    F: FnMut(&SchedulerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for scheduler event")
}

/// Drain events already buffered on `events`.
pub fn drain(events: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
