//! Delete reconciliation.
//!
//! Removing a photo touches three places that must agree: the owner's photo
//! list, the tombstone log the remote consumes, and the local ledger row. All
//! three change in one transaction; the local binary is released after
//! commit, and the row is purged once the binary is gone.
//!
//! Requests are idempotent: repeating one (or racing it against itself)
//! never writes a second tombstone for the same binary.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use fieldsync_core::{
    Attachment, AttachmentState, DeleteOutcome, OwnerRef, PhotoEntry, Result, Transition,
};

use crate::attachments::SqliteAttachmentLedger;
use crate::file_storage::StorageBackend;
use crate::owners::OwnerRegistry;
use crate::tombstones::SqliteTombstoneRepository;

/// What the delete transaction found and changed.
struct Committed {
    outcome: DeleteOutcome,
    /// Row left in QUEUED_DELETE whose binary still needs releasing.
    release: Option<(Uuid, Option<PathBuf>)>,
}

/// Handles user-initiated photo deletes.
#[derive(Clone)]
pub struct DeleteReconciler {
    writer: SqlitePool,
    ledger: SqliteAttachmentLedger,
    tombstones: SqliteTombstoneRepository,
    owners: Arc<OwnerRegistry>,
    storage: Arc<dyn StorageBackend>,
}

impl DeleteReconciler {
    pub fn new(
        writer: SqlitePool,
        ledger: SqliteAttachmentLedger,
        tombstones: SqliteTombstoneRepository,
        owners: Arc<OwnerRegistry>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            writer,
            ledger,
            tombstones,
            owners,
            storage,
        }
    }

    /// Delete one photo from an owner.
    ///
    /// `last_known_remote_ref` is the URL/filename the caller last saw for
    /// the photo; it wins over anything the ledger knows when naming the
    /// remote binary in the tombstone. A request for something already gone
    /// succeeds and changes nothing.
    #[instrument(skip(self), fields(owner = %owner, attachment_id = %attachment_id))]
    pub async fn request_delete(
        &self,
        owner: &OwnerRef,
        attachment_id: Uuid,
        last_known_remote_ref: Option<&str>,
    ) -> Result<DeleteOutcome> {
        let committed = self
            .commit_delete(owner, attachment_id, last_known_remote_ref)
            .await
            .map_err(|e| {
                let e = e.into_transaction("request_delete");
                warn!(error = %e, "Delete transaction rolled back");
                e
            })?;

        let mut outcome = committed.outcome;
        if let Some((id, local_path)) = committed.release {
            outcome.binary_released = self.release(id, local_path).await;
        }

        if outcome.already_satisfied() {
            debug!("Delete already satisfied");
        } else {
            info!(
                entry_removed = outcome.entry_removed,
                tombstone_written = outcome.tombstone_written,
                row_marked = outcome.row_marked,
                binary_released = outcome.binary_released,
                "Photo deleted"
            );
        }
        Ok(outcome)
    }

    /// Release binaries of rows left in QUEUED_DELETE (for example by a
    /// crash between commit and cleanup). Returns the number purged.
    pub async fn sweep_released(&self) -> Result<u64> {
        let mut purged = 0u64;
        loop {
            let batch = self
                .ledger
                .list_by_state(AttachmentState::QueuedDelete, 100)
                .await?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = false;
            for row in batch {
                if self.release(row.id, row.local_path).await {
                    purged += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if purged > 0 {
            info!(purged, "Released binaries of deleted attachments");
        }
        Ok(purged)
    }

    async fn commit_delete(
        &self,
        owner: &OwnerRef,
        attachment_id: Uuid,
        last_known_remote_ref: Option<&str>,
    ) -> Result<Committed> {
        let mut tx = self.writer.begin().await?;
        let mut outcome = DeleteOutcome::default();

        let removed_entry = self
            .remove_photo_entry(&mut tx, owner, attachment_id)
            .await?;
        outcome.entry_removed = removed_entry.is_some();

        let row = self.ledger.get_tx(&mut tx, attachment_id).await?;
        if let Some(row) = &row {
            if &row.owner != owner {
                warn!(row_owner = %row.owner, "Delete requested through a different owner than the ledger row");
            }
        }

        if !self
            .tombstones
            .exists_for_attachment_tx(&mut tx, attachment_id)
            .await?
        {
            if let Some(reference) =
                tombstone_reference(last_known_remote_ref, row.as_ref(), removed_entry.as_ref())
            {
                let tombstone_owner = row.as_ref().map(|r| &r.owner).unwrap_or(owner);
                outcome.tombstone_written = self
                    .tombstones
                    .append_tx(&mut tx, tombstone_owner, attachment_id, &reference)
                    .await?
                    .is_some();
            }
        }

        let mut release = None;
        if let Some(row) = row {
            outcome.row_marked = self
                .ledger
                .mark_queued_delete_tx(&mut tx, attachment_id)
                .await?
                == Transition::Applied;
            release = Some((row.id, row.local_path));
        }

        tx.commit().await?;
        Ok(Committed { outcome, release })
    }

    async fn remove_photo_entry(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerRef,
        attachment_id: Uuid,
    ) -> Result<Option<PhotoEntry>> {
        let list = self.owners.get(owner.kind)?;
        let Some(mut photos) = list.read_photos(&mut **tx, &owner.id).await? else {
            return Ok(None);
        };
        let Some(pos) = photos.iter().position(|p| p.id == attachment_id) else {
            return Ok(None);
        };
        let entry = photos.remove(pos);
        list.write_photos(&mut **tx, &owner.id, &photos).await?;
        Ok(Some(entry))
    }

    /// Delete the binary, then the row. Returns whether this call purged the
    /// row. Failures leave it in QUEUED_DELETE for the next sweep.
    async fn release(&self, id: Uuid, local_path: Option<PathBuf>) -> bool {
        if let Some(path) = &local_path {
            if let Err(e) = self.storage.release(path).await {
                warn!(attachment_id = %id, path = %path.display(), error = %e, "Failed to release local binary");
                return false;
            }
        }
        match self.ledger.purge_released(id).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(attachment_id = %id, "Deleted attachment row already gone or moved on");
                false
            }
            Err(e) => {
                warn!(attachment_id = %id, error = %e, "Failed to purge deleted attachment row");
                false
            }
        }
    }
}

/// Name of the remote binary a tombstone should point at.
///
/// Preference: what the caller last saw, the name the remote assigned, the
/// photo entry's url, then the upload key.
fn tombstone_reference(
    last_known_remote_ref: Option<&str>,
    row: Option<&Attachment>,
    entry: Option<&PhotoEntry>,
) -> Option<String> {
    last_known_remote_ref
        .filter(|r| !r.trim().is_empty())
        .map(str::to_owned)
        .or_else(|| row.and_then(|r| r.remote_filename.clone()))
        .or_else(|| entry.map(|e| e.url_or_filename.clone()))
        .or_else(|| row.map(|r| r.filename.clone()))
}
