//! The remote-sync primitive: push queued binaries, then apply tombstones.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, trace, warn};

use fieldsync_core::defaults::SYNC_PAGE_SIZE;
use fieldsync_core::{
    Attachment, AttachmentState, DeleteOperation, Error, RemoteStore, RemoteUpload, Result,
    SyncPrimitive, SyncReport, Transition,
};
use fieldsync_db::{Database, StorageBackend};

/// How one queued item ended.
enum ItemOutcome {
    Uploaded,
    Failed,
    /// Transient transport error; the row is back in the queue.
    Deferred(String),
    /// Someone else moved the row first (deleted, or another pass claimed it).
    Skipped,
}

/// Attempts made in one pass, for deciding whether the pass failed.
#[derive(Default)]
struct Attempts {
    made: u64,
    transient: u64,
    last_error: Option<String>,
}

impl Attempts {
    fn record(&mut self) {
        self.made += 1;
    }

    fn record_transient(&mut self, error: String) {
        self.made += 1;
        self.transient += 1;
        self.last_error = Some(error);
    }

    fn all_transient(&self) -> bool {
        self.transient > 0 && self.transient == self.made
    }
}

/// [`SyncPrimitive`] over a [`RemoteStore`] transport.
///
/// Each queued row and each unconsumed tombstone is attempted at most once
/// per pass. Permanent per-item failures mark that item FAILED. Transient
/// ones put it back in the queue for the next pass. The pass as a whole
/// fails only when the remote is unreachable or every attempt in it failed
/// transiently.
pub struct AttachmentSyncPass {
    db: Database,
    storage: Arc<dyn StorageBackend>,
    remote: Arc<dyn RemoteStore>,
    page_size: i64,
}

impl AttachmentSyncPass {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageBackend>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            db,
            storage,
            remote,
            page_size: SYNC_PAGE_SIZE,
        }
    }

    /// Set how many rows are fetched per page.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn upload_queued(&self, report: &mut SyncReport, attempts: &mut Attempts) -> Result<()> {
        let mut cursor: Option<Attachment> = None;
        loop {
            let page = self
                .db
                .attachments
                .list_by_state_after(AttachmentState::QueuedUpload, cursor.as_ref(), self.page_size)
                .await?;
            if page.is_empty() {
                return Ok(());
            }

            for row in &page {
                match self.upload_one(row).await? {
                    ItemOutcome::Uploaded => {
                        report.uploaded += 1;
                        attempts.record();
                    }
                    ItemOutcome::Failed => {
                        report.failed += 1;
                        attempts.record();
                    }
                    ItemOutcome::Deferred(error) => {
                        report.deferred += 1;
                        attempts.record_transient(error);
                    }
                    ItemOutcome::Skipped => {}
                }
            }
            cursor = page.into_iter().last();
        }
    }

    async fn upload_one(&self, row: &Attachment) -> Result<ItemOutcome> {
        let ledger = &self.db.attachments;
        if ledger.begin_upload(row.id).await? != Transition::Applied {
            trace!(attachment_id = %row.id, "Row no longer queued, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        let data = match &row.local_path {
            Some(path) => self.storage.read(path).await,
            None => Err(Error::NotFound(format!("local binary for {}", row.id))),
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                let message = format!("local binary unreadable: {e}");
                ledger.mark_failed(row.id, &message).await?;
                return Ok(ItemOutcome::Failed);
            }
        };

        let upload = RemoteUpload {
            attachment_id: row.id,
            owner_id: row.owner.id.clone(),
            photo_kind: row.photo_kind,
            filename: row.filename.clone(),
            content_type: row.content_type.clone(),
            content_hash: row.content_hash.clone(),
            data,
        };

        match self.remote.upload(upload).await {
            Ok(remote_filename) => match ledger.mark_synced(row.id, &remote_filename).await? {
                Transition::Applied | Transition::Unchanged => Ok(ItemOutcome::Uploaded),
                Transition::Rejected(_) | Transition::Missing => {
                    // Deleted while in flight: make sure the copy that just
                    // landed remotely is cleaned up too.
                    self.db
                        .tombstones
                        .append(&row.owner, row.id, &remote_filename)
                        .await?;
                    debug!(attachment_id = %row.id, remote_filename, "Upload raced a delete, tombstoned");
                    Ok(ItemOutcome::Skipped)
                }
            },
            Err(e) if e.is_transient() => {
                warn!(attachment_id = %row.id, error = %e, "Upload interrupted, requeued");
                ledger.revert_upload(row.id).await?;
                Ok(ItemOutcome::Deferred(format!("upload of {} interrupted: {}", row.id, e)))
            }
            Err(e) => {
                ledger.mark_failed(row.id, &e.to_string()).await?;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    async fn apply_tombstones(
        &self,
        report: &mut SyncReport,
        attempts: &mut Attempts,
    ) -> Result<()> {
        let mut cursor: Option<DeleteOperation> = None;
        loop {
            let page = self
                .db
                .tombstones
                .list_unconsumed_after(cursor.as_ref(), self.page_size)
                .await?;
            if page.is_empty() {
                return Ok(());
            }

            for tombstone in &page {
                match self.remote.delete(tombstone).await {
                    Ok(()) => {
                        attempts.record();
                        if self.db.tombstones.acknowledge(tombstone.id).await? {
                            report.tombstones_applied += 1;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        debug!(tombstone_id = %tombstone.id, error = %e, "Tombstone deferred");
                        report.deferred += 1;
                        attempts.record_transient(format!(
                            "tombstone {} not applied: {}",
                            tombstone.id, e
                        ));
                    }
                    Err(e) => {
                        attempts.record();
                        warn!(
                            tombstone_id = %tombstone.id,
                            remote_reference = %tombstone.remote_reference,
                            error = %e,
                            "Remote rejected tombstone, will retry next pass"
                        );
                    }
                }
            }
            cursor = page.into_iter().last();
        }
    }
}

#[async_trait]
impl SyncPrimitive for AttachmentSyncPass {
    #[instrument(skip(self))]
    async fn sync_pending(&self) -> Result<SyncReport> {
        let start = Instant::now();
        self.remote
            .probe()
            .await
            .map_err(|e| Error::Sync(format!("remote unreachable: {e}")))?;

        let mut report = SyncReport::default();
        let mut attempts = Attempts::default();
        self.upload_queued(&mut report, &mut attempts).await?;
        self.apply_tombstones(&mut report, &mut attempts).await?;

        if attempts.all_transient() {
            return Err(Error::Sync(format!(
                "all {} attempts failed transiently, last: {}",
                attempts.transient,
                attempts.last_error.unwrap_or_default()
            )));
        }

        info!(
            subsystem = "sync",
            uploaded = report.uploaded,
            failed = report.failed,
            deferred = report.deferred,
            tombstones_applied = report.tombstones_applied,
            duration_ms = start.elapsed().as_millis() as u64,
            "Sync pass finished"
        );
        Ok(report)
    }
}
