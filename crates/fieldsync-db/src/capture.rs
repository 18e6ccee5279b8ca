//! Capture pipeline: validate a source binary, copy it into attachment-owned
//! storage, and record it in the ledger and the owner's photo list in one
//! transaction.
//!
//! After staging, the binary is the subsystem's responsibility: the source
//! may be deleted and the upload will still happen.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::fs;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use fieldsync_core::defaults::CONTENT_SNIFF_BYTES;
use fieldsync_core::{
    detect_content_type, extension_for_mime, new_v7, validate_header, Attachment, BatchOutcome,
    CaptureInput, Error, NewAttachment, OwnerRef, PhotoEntry, PhotoKind, Rejection,
    RejectionReason, Result, ValidationError,
};

use crate::attachments::SqliteAttachmentLedger;
use crate::file_storage::{compute_content_hash, StorageBackend};
use crate::owners::OwnerRepository;

/// Why a single input did not make it into the ledger.
enum StageFailure {
    /// Skip this input and keep going.
    Rejected(RejectionReason),
    /// The store itself failed; stop.
    Fatal(Error),
}

impl From<StageFailure> for Error {
    fn from(failure: StageFailure) -> Self {
        match failure {
            StageFailure::Rejected(RejectionReason::Invalid(e)) => Error::Validation(e),
            StageFailure::Rejected(RejectionReason::Unreadable(msg)) => {
                Error::Io(std::io::Error::other(msg))
            }
            StageFailure::Fatal(e) => e,
        }
    }
}

/// Stages captured binaries for upload.
#[derive(Clone)]
pub struct CapturePipeline {
    writer: SqlitePool,
    ledger: SqliteAttachmentLedger,
    owners: OwnerRepository,
    storage: Arc<dyn StorageBackend>,
    upload_signal: Arc<Notify>,
}

impl CapturePipeline {
    pub fn new(
        writer: SqlitePool,
        ledger: SqliteAttachmentLedger,
        owners: OwnerRepository,
        storage: Arc<dyn StorageBackend>,
        upload_signal: Arc<Notify>,
    ) -> Self {
        Self {
            writer,
            ledger,
            owners,
            storage,
            upload_signal,
        }
    }

    /// Notified whenever new work is staged.
    pub fn upload_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.upload_signal)
    }

    /// Stage one source binary against an owner.
    ///
    /// Validation failures come back as [`Error::Validation`]; a failed
    /// transaction as [`Error::Transaction`], in which case nothing was saved
    /// and the copy has been removed.
    #[instrument(skip(self), fields(owner = %owner, source = %source.display()))]
    pub async fn stage(
        &self,
        source: &Path,
        owner: &OwnerRef,
        photo_kind: PhotoKind,
        max_size_bytes: u64,
    ) -> Result<Attachment> {
        self.ensure_owner(owner).await?;
        let attachment = self
            .stage_one(source, owner, photo_kind, max_size_bytes)
            .await?;
        self.upload_signal.notify_one();
        Ok(attachment)
    }

    /// Stage several sources against one owner.
    ///
    /// Per-item problems are collected as rejections. A failed transaction
    /// stops the batch and is returned; inputs committed before it stay
    /// staged.
    #[instrument(skip(self, inputs), fields(owner = %owner, inputs = inputs.len()))]
    pub async fn stage_batch(
        &self,
        owner: &OwnerRef,
        inputs: &[CaptureInput],
        max_size_bytes: u64,
    ) -> Result<BatchOutcome> {
        self.ensure_owner(owner).await?;

        let mut outcome = BatchOutcome::default();
        for input in inputs {
            match self
                .stage_one(&input.source, owner, input.photo_kind, max_size_bytes)
                .await
            {
                Ok(attachment) => outcome.staged.push(attachment),
                Err(StageFailure::Rejected(reason)) => {
                    warn!(source = %input.source.display(), reason = %reason, "Capture input rejected");
                    outcome.rejected.push(Rejection {
                        source: input.source.clone(),
                        reason,
                    });
                }
                Err(StageFailure::Fatal(e)) => {
                    if !outcome.staged.is_empty() {
                        self.upload_signal.notify_one();
                    }
                    return Err(e);
                }
            }
        }

        if !outcome.staged.is_empty() {
            self.upload_signal.notify_one();
        }
        info!(
            staged = outcome.staged_count(),
            rejected = outcome.rejected_count(),
            "Capture batch staged"
        );
        Ok(outcome)
    }

    async fn ensure_owner(&self, owner: &OwnerRef) -> Result<()> {
        if self.owners.exists(owner).await? {
            Ok(())
        } else {
            Err(Error::OwnerNotFound {
                kind: owner.kind,
                id: owner.id.clone(),
            })
        }
    }

    async fn stage_one(
        &self,
        source: &Path,
        owner: &OwnerRef,
        photo_kind: PhotoKind,
        max_size_bytes: u64,
    ) -> std::result::Result<Attachment, StageFailure> {
        let data = read_source(source, max_size_bytes)
            .await
            .map_err(StageFailure::Rejected)?;

        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = &data[..data.len().min(CONTENT_SNIFF_BYTES)];
        let content_type = detect_content_type(&source_name, header);

        let id = new_v7();
        let filename = format!("{}.{}", id, extension_for_mime(&content_type));
        let local_path = self
            .storage
            .write(&filename, &data)
            .await
            .map_err(|e| StageFailure::Rejected(RejectionReason::Unreadable(e.to_string())))?;

        let new = NewAttachment {
            id,
            owner: owner.clone(),
            photo_kind,
            filename,
            local_path: local_path.clone(),
            content_type,
            content_hash: compute_content_hash(&data),
            size_bytes: data.len() as i64,
            created_at: Utc::now(),
        };

        match self.commit_staged(&new).await {
            Ok(attachment) => {
                info!(
                    attachment_id = %attachment.id,
                    owner = %owner,
                    photo_kind = %photo_kind,
                    content_type = %attachment.content_type,
                    size_bytes = attachment.size_bytes,
                    "Attachment staged"
                );
                Ok(attachment)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage.release(&local_path).await {
                    warn!(path = %local_path.display(), error = %cleanup, "Failed to remove copy after rollback");
                }
                let e = e.into_transaction("stage");
                warn!(attachment_id = %id, owner = %owner, error = %e, "Staging transaction rolled back");
                Err(StageFailure::Fatal(e))
            }
        }
    }

    /// Ledger row and photo entry, both or neither.
    async fn commit_staged(&self, new: &NewAttachment) -> Result<Attachment> {
        let mut tx = self.writer.begin().await?;
        let list = self.owners.registry().get(new.owner.kind)?;

        let mut photos = list
            .read_photos(&mut tx, &new.owner.id)
            .await?
            .ok_or_else(|| Error::OwnerNotFound {
                kind: new.owner.kind,
                id: new.owner.id.clone(),
            })?;

        let attachment = self.ledger.insert_tx(&mut tx, new).await?;
        photos.push(PhotoEntry::for_attachment(&attachment));
        list.write_photos(&mut tx, &new.owner.id, &photos).await?;

        tx.commit().await?;
        Ok(attachment)
    }
}

/// Validate the source and read it into memory.
async fn read_source(
    source: &Path,
    max_size_bytes: u64,
) -> std::result::Result<Vec<u8>, RejectionReason> {
    let invalid = RejectionReason::Invalid;
    let path = source.to_path_buf();

    let metadata = match fs::metadata(source).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(invalid(ValidationError::Missing(path)))
        }
        Err(e) => return Err(RejectionReason::Unreadable(e.to_string())),
    };
    if !metadata.is_file() {
        return Err(invalid(ValidationError::NotAFile(path)));
    }
    check_size(&path, metadata.len(), max_size_bytes)?;

    let data = match fs::read(source).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(invalid(ValidationError::Missing(path)))
        }
        Err(e) => return Err(RejectionReason::Unreadable(e.to_string())),
    };
    // The source may have changed between stat and read.
    check_size(&path, data.len() as u64, max_size_bytes)?;

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let verdict = validate_header(&name, &data[..data.len().min(CONTENT_SNIFF_BYTES)]);
    if !verdict.allowed {
        return Err(invalid(ValidationError::Blocked {
            path,
            reason: verdict.block_reason.unwrap_or_default(),
        }));
    }

    Ok(data)
}

fn check_size(
    path: &Path,
    size_bytes: u64,
    max_bytes: u64,
) -> std::result::Result<(), RejectionReason> {
    if size_bytes == 0 {
        return Err(RejectionReason::Invalid(ValidationError::Empty(
            path.to_path_buf(),
        )));
    }
    if size_bytes > max_bytes {
        return Err(RejectionReason::Invalid(ValidationError::Oversized {
            path: path.to_path_buf(),
            size_bytes,
            max_bytes,
        }));
    }
    Ok(())
}
