//! Attachment ledger: one row per captured binary and its state machine.
//!
//! Every transition is a conditional write. A request against a row that has
//! already moved on (deleted while uploading, synced twice) is reported as
//! [`Transition::Rejected`] or [`Transition::Unchanged`] rather than an error,
//! and writes nothing.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldsync_core::{
    Attachment, AttachmentState, Error, NewAttachment, OwnerKind, OwnerRef, PhotoStatus, Result,
    Transition,
};

use crate::owners::{update_photo_entry, OwnerRegistry};

const ATTACHMENT_COLUMNS: &str = "id, owner_entity_id, owner_entity_kind, photo_kind, filename, \
     local_path, remote_filename, state, content_type, content_hash, size_bytes, retry_count, \
     last_error, created_at, updated_at";

/// SQLite-backed attachment ledger.
#[derive(Clone)]
pub struct SqliteAttachmentLedger {
    pool: SqlitePool,
    writer: SqlitePool,
    owners: Arc<OwnerRegistry>,
}

impl SqliteAttachmentLedger {
    pub fn new(pool: SqlitePool, writer: SqlitePool, owners: Arc<OwnerRegistry>) -> Self {
        Self {
            pool,
            writer,
            owners,
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| attachment_from_row(&r)).transpose()
    }

    /// Transaction-aware variant of get.
    pub async fn get_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<Attachment>> {
        fetch_one_row(&mut **tx, id).await
    }

    /// Rows in `state`, oldest capture first.
    pub async fn list_by_state(&self, state: AttachmentState, limit: i64) -> Result<Vec<Attachment>> {
        self.list_by_state_after(state, None, limit).await
    }

    /// Rows in `state` strictly after `after` in `(created_at, id)` order.
    ///
    /// Lets a caller walk the whole queue once even when rows it has already
    /// seen stay in `state`.
    pub async fn list_by_state_after(
        &self,
        state: AttachmentState,
        after: Option<&Attachment>,
        limit: i64,
    ) -> Result<Vec<Attachment>> {
        let rows = match after {
            None => {
                let sql = format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE state = ?1 \
                     ORDER BY created_at, id LIMIT ?2"
                );
                sqlx::query(&sql)
                    .bind(state.as_i64())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(cursor) => {
                let sql = format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE state = ?1 \
                     AND (created_at > ?2 OR (created_at = ?2 AND id > ?3)) \
                     ORDER BY created_at, id LIMIT ?4"
                );
                sqlx::query(&sql)
                    .bind(state.as_i64())
                    .bind(cursor.created_at)
                    .bind(cursor.id.to_string())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn list_for_owner(&self, owner: &OwnerRef) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments \
             WHERE owner_entity_kind = ?1 AND owner_entity_id = ?2 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.kind.as_str())
            .bind(&owner.id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn count_by_state(&self, state: AttachmentState) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE state = ?1")
            .bind(state.as_i64())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Rows still waiting for the remote: QUEUED_UPLOAD plus UPLOADING.
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE state IN (?1, ?2)")
                .bind(AttachmentState::QueuedUpload.as_i64())
                .bind(AttachmentState::Uploading.as_i64())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    // =========================================================================
    // INSERT
    // =========================================================================

    /// Insert a freshly staged row in QUEUED_UPLOAD.
    pub async fn insert_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        new: &NewAttachment,
    ) -> Result<Attachment> {
        sqlx::query(
            r#"INSERT INTO attachments
               (id, owner_entity_id, owner_entity_kind, photo_kind, filename, local_path,
                remote_filename, state, content_type, content_hash, size_bytes, retry_count,
                last_error, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, 0, NULL, ?11, ?11)"#,
        )
        .bind(new.id.to_string())
        .bind(&new.owner.id)
        .bind(new.owner.kind.as_str())
        .bind(new.photo_kind.as_str())
        .bind(&new.filename)
        .bind(new.local_path.to_string_lossy().into_owned())
        .bind(AttachmentState::QueuedUpload.as_i64())
        .bind(&new.content_type)
        .bind(&new.content_hash)
        .bind(new.size_bytes)
        .bind(new.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(Attachment {
            id: new.id,
            owner: new.owner.clone(),
            photo_kind: new.photo_kind,
            filename: new.filename.clone(),
            local_path: Some(new.local_path.clone()),
            remote_filename: None,
            state: AttachmentState::QueuedUpload,
            content_type: new.content_type.clone(),
            content_hash: new.content_hash.clone(),
            size_bytes: new.size_bytes,
            retry_count: 0,
            last_error: None,
            created_at: new.created_at,
            updated_at: new.created_at,
        })
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// QUEUED_UPLOAD to UPLOADING. Only one caller can win this for a row.
    pub async fn begin_upload(&self, id: Uuid) -> Result<Transition> {
        let result = sqlx::query(
            "UPDATE attachments SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
        )
        .bind(AttachmentState::Uploading.as_i64())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(AttachmentState::QueuedUpload.as_i64())
        .execute(&self.writer)
        .await?;

        if result.rows_affected() == 1 {
            debug!(attachment_id = %id, "Attachment uploading");
            return Ok(Transition::Applied);
        }
        self.classify_noop(id, AttachmentState::Uploading).await
    }

    /// Record a successful upload and flip the photo entry to uploaded.
    ///
    /// A row already SYNCED is left untouched, `updated_at` included.
    pub async fn mark_synced(&self, id: Uuid, remote_filename: &str) -> Result<Transition> {
        let mut tx = self.writer.begin().await?;
        let Some((state, owner)) = state_and_owner(&mut tx, id).await? else {
            return Ok(Transition::Missing);
        };
        if state == AttachmentState::Synced {
            return Ok(Transition::Unchanged);
        }
        if !state.can_transition_to(AttachmentState::Synced) {
            return Ok(Transition::Rejected(state));
        }

        sqlx::query(
            "UPDATE attachments SET state = ?1, remote_filename = ?2, last_error = NULL, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(AttachmentState::Synced.as_i64())
        .bind(remote_filename)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        let remote = remote_filename.to_string();
        update_photo_entry(&self.owners, &mut tx, &owner, id, move |entry| {
            entry.status = PhotoStatus::Uploaded;
            entry.url_or_filename = remote;
        })
        .await?;

        tx.commit().await?;
        info!(attachment_id = %id, owner = %owner, remote_filename, "Attachment synced");
        Ok(Transition::Applied)
    }

    /// Record a per-item upload failure and flip the photo entry to failed.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Transition> {
        let mut tx = self.writer.begin().await?;
        let Some((state, owner)) = state_and_owner(&mut tx, id).await? else {
            return Ok(Transition::Missing);
        };
        if state == AttachmentState::Failed {
            return Ok(Transition::Unchanged);
        }
        if !state.can_transition_to(AttachmentState::Failed) {
            return Ok(Transition::Rejected(state));
        }

        sqlx::query(
            "UPDATE attachments SET state = ?1, retry_count = retry_count + 1, last_error = ?2, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(AttachmentState::Failed.as_i64())
        .bind(error)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        update_photo_entry(&self.owners, &mut tx, &owner, id, |entry| {
            entry.status = PhotoStatus::Failed;
        })
        .await?;

        tx.commit().await?;
        warn!(attachment_id = %id, owner = %owner, error, "Attachment upload failed");
        Ok(Transition::Applied)
    }

    /// UPLOADING back to QUEUED_UPLOAD after a transport error. The item
    /// itself was never judged, so neither retry_count nor the photo entry
    /// changes.
    pub async fn revert_upload(&self, id: Uuid) -> Result<Transition> {
        let result = sqlx::query(
            "UPDATE attachments SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
        )
        .bind(AttachmentState::QueuedUpload.as_i64())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(AttachmentState::Uploading.as_i64())
        .execute(&self.writer)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Transition::Applied);
        }
        self.classify_noop(id, AttachmentState::QueuedUpload).await
    }

    /// Move FAILED rows back to QUEUED_UPLOAD when their owner still exists.
    ///
    /// Rows whose owner is gone stay FAILED. Returns the number requeued.
    pub async fn requeue_failed(&self) -> Result<u64> {
        let mut tx = self.writer.begin().await?;
        let rows = sqlx::query(
            "SELECT id, owner_entity_id, owner_entity_kind FROM attachments \
             WHERE state = ?1 ORDER BY created_at, id",
        )
        .bind(AttachmentState::Failed.as_i64())
        .fetch_all(&mut *tx)
        .await?;

        let mut requeued = 0u64;
        for row in rows {
            let id = parse_uuid(row.try_get("id")?)?;
            let owner = parse_owner(row.try_get("owner_entity_kind")?, row.try_get("owner_entity_id")?)?;

            if !self.owners.get(owner.kind)?.exists(&mut tx, &owner.id).await? {
                debug!(attachment_id = %id, owner = %owner, "Owner gone, failed attachment not requeued");
                continue;
            }

            sqlx::query("UPDATE attachments SET state = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(AttachmentState::QueuedUpload.as_i64())
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            update_photo_entry(&self.owners, &mut tx, &owner, id, |entry| {
                entry.status = PhotoStatus::Pending;
            })
            .await?;
            requeued += 1;
        }

        tx.commit().await?;
        if requeued > 0 {
            info!(requeued, "Failed attachments requeued");
        }
        Ok(requeued)
    }

    /// Put rows left UPLOADING by a crash back in the queue.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE attachments SET state = ?1, updated_at = ?2 WHERE state = ?3")
            .bind(AttachmentState::QueuedUpload.as_i64())
            .bind(Utc::now())
            .bind(AttachmentState::Uploading.as_i64())
            .execute(&self.writer)
            .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Interrupted uploads returned to queue");
        }
        Ok(recovered)
    }

    /// Any state except QUEUED_DELETE to QUEUED_DELETE.
    pub async fn mark_queued_delete_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Transition> {
        let result = sqlx::query(
            "UPDATE attachments SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state <> ?1",
        )
        .bind(AttachmentState::QueuedDelete.as_i64())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Transition::Applied);
        }
        match fetch_one_row(&mut **tx, id).await? {
            Some(_) => Ok(Transition::Unchanged),
            None => Ok(Transition::Missing),
        }
    }

    /// Remove a QUEUED_DELETE row once its binary is gone.
    pub async fn purge_released(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?1 AND state = ?2")
            .bind(id.to_string())
            .bind(AttachmentState::QueuedDelete.as_i64())
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Report why a conditional update touched nothing.
    async fn classify_noop(&self, id: Uuid, target: AttachmentState) -> Result<Transition> {
        match self.get(id).await? {
            None => Ok(Transition::Missing),
            Some(row) if row.state == target => Ok(Transition::Unchanged),
            Some(row) => Ok(Transition::Rejected(row.state)),
        }
    }
}

async fn fetch_one_row(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Attachment>> {
    let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| attachment_from_row(&r)).transpose()
}

async fn state_and_owner(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<(AttachmentState, OwnerRef)>> {
    let row = sqlx::query(
        "SELECT state, owner_entity_id, owner_entity_kind FROM attachments WHERE id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let state = parse_state(row.try_get("state")?)?;
    let owner = parse_owner(row.try_get("owner_entity_kind")?, row.try_get("owner_entity_id")?)?;
    Ok(Some((state, owner)))
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| Error::Internal(format!("invalid id {raw:?} in ledger: {e}")))
}

fn parse_state(raw: i64) -> Result<AttachmentState> {
    AttachmentState::from_i64(raw)
        .ok_or_else(|| Error::Internal(format!("invalid attachment state {raw} in ledger")))
}

fn parse_owner(kind: String, id: String) -> Result<OwnerRef> {
    let kind: OwnerKind = kind.parse().map_err(Error::Internal)?;
    Ok(OwnerRef::new(kind, id))
}

fn attachment_from_row(row: &SqliteRow) -> Result<Attachment> {
    let photo_kind: String = row.try_get("photo_kind")?;
    let local_path: Option<String> = row.try_get("local_path")?;
    Ok(Attachment {
        id: parse_uuid(row.try_get("id")?)?,
        owner: parse_owner(row.try_get("owner_entity_kind")?, row.try_get("owner_entity_id")?)?,
        photo_kind: photo_kind.parse().map_err(Error::Internal)?,
        filename: row.try_get("filename")?,
        local_path: local_path.map(PathBuf::from),
        remote_filename: row.try_get("remote_filename")?,
        state: parse_state(row.try_get("state")?)?,
        content_type: row.try_get("content_type")?,
        content_hash: row.try_get("content_hash")?,
        size_bytes: row.try_get("size_bytes")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
