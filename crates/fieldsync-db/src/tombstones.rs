//! Append-only tombstone log.
//!
//! A tombstone tells the remote store to forget one binary. Rows are never
//! updated or deleted (triggers enforce this); consuming a tombstone appends
//! an ack row instead.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use fieldsync_core::{new_v7, DeleteOperation, Error, OwnerRef, Result};

/// SQLite-backed tombstone log.
#[derive(Clone)]
pub struct SqliteTombstoneRepository {
    pool: SqlitePool,
    writer: SqlitePool,
}

impl SqliteTombstoneRepository {
    pub fn new(pool: SqlitePool, writer: SqlitePool) -> Self {
        Self { pool, writer }
    }

    /// Append a tombstone unless one already names the same remote binary.
    ///
    /// Returns the tombstone when this call wrote it.
    pub async fn append_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerRef,
        attachment_id: Uuid,
        remote_reference: &str,
    ) -> Result<Option<DeleteOperation>> {
        let op = DeleteOperation {
            id: new_v7(),
            owner: owner.clone(),
            attachment_id,
            remote_reference: remote_reference.to_string(),
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO delete_operations
               (id, owner_entity_id, owner_entity_kind, attachment_id, remote_reference, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(op.id.to_string())
        .bind(&op.owner.id)
        .bind(op.owner.kind.as_str())
        .bind(attachment_id.to_string())
        .bind(&op.remote_reference)
        .bind(op.created_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            debug!(attachment_id = %attachment_id, remote_reference, "Tombstone already recorded");
            return Ok(None);
        }
        info!(
            tombstone_id = %op.id,
            attachment_id = %attachment_id,
            remote_reference,
            "Tombstone recorded"
        );
        Ok(Some(op))
    }

    /// Append a tombstone in its own transaction.
    pub async fn append(
        &self,
        owner: &OwnerRef,
        attachment_id: Uuid,
        remote_reference: &str,
    ) -> Result<Option<DeleteOperation>> {
        let mut tx = self.writer.begin().await?;
        let op = self
            .append_tx(&mut tx, owner, attachment_id, remote_reference)
            .await?;
        tx.commit().await?;
        Ok(op)
    }

    /// Whether any tombstone exists for the attachment.
    pub async fn exists_for_attachment_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        attachment_id: Uuid,
    ) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM delete_operations WHERE attachment_id = ?1 LIMIT 1")
            .bind(attachment_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_for_attachment(&self, attachment_id: Uuid) -> Result<Vec<DeleteOperation>> {
        let rows = sqlx::query(
            r#"SELECT id, owner_entity_id, owner_entity_kind, attachment_id, remote_reference, created_at
               FROM delete_operations WHERE attachment_id = ?1 ORDER BY created_at, id"#,
        )
        .bind(attachment_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tombstone_from_row).collect()
    }

    /// Tombstones the remote has not yet acknowledged, oldest first.
    pub async fn list_unconsumed(&self, limit: i64) -> Result<Vec<DeleteOperation>> {
        self.list_unconsumed_after(None, limit).await
    }

    /// Unacknowledged tombstones strictly after `after` in `(created_at, id)`
    /// order, so refused ones at the head do not hide newer ones.
    pub async fn list_unconsumed_after(
        &self,
        after: Option<&DeleteOperation>,
        limit: i64,
    ) -> Result<Vec<DeleteOperation>> {
        let rows = match after {
            None => {
                sqlx::query(
                    r#"SELECT d.id, d.owner_entity_id, d.owner_entity_kind, d.attachment_id,
                              d.remote_reference, d.created_at
                       FROM delete_operations d
                       LEFT JOIN delete_operation_acks a ON a.delete_operation_id = d.id
                       WHERE a.delete_operation_id IS NULL
                       ORDER BY d.created_at, d.id
                       LIMIT ?1"#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                sqlx::query(
                    r#"SELECT d.id, d.owner_entity_id, d.owner_entity_kind, d.attachment_id,
                              d.remote_reference, d.created_at
                       FROM delete_operations d
                       LEFT JOIN delete_operation_acks a ON a.delete_operation_id = d.id
                       WHERE a.delete_operation_id IS NULL
                         AND (d.created_at > ?1 OR (d.created_at = ?1 AND d.id > ?2))
                       ORDER BY d.created_at, d.id
                       LIMIT ?3"#,
                )
                .bind(cursor.created_at)
                .bind(cursor.id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(tombstone_from_row).collect()
    }

    pub async fn count_unconsumed(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM delete_operations d
               LEFT JOIN delete_operation_acks a ON a.delete_operation_id = d.id
               WHERE a.delete_operation_id IS NULL"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Total tombstones ever written, consumed or not.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delete_operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Mark a tombstone consumed. Acknowledging twice is a no-op.
    pub async fn acknowledge(&self, tombstone_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO delete_operation_acks (delete_operation_id, acknowledged_at) \
             VALUES (?1, ?2)",
        )
        .bind(tombstone_id.to_string())
        .bind(Utc::now())
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn tombstone_from_row(row: &SqliteRow) -> Result<DeleteOperation> {
    let id: String = row.try_get("id")?;
    let attachment_id: String = row.try_get("attachment_id")?;
    let kind: String = row.try_get("owner_entity_kind")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(DeleteOperation {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(e.to_string()))?,
        owner: OwnerRef::new(
            kind.parse().map_err(Error::Internal)?,
            row.try_get::<String, _>("owner_entity_id")?,
        ),
        attachment_id: Uuid::parse_str(&attachment_id)
            .map_err(|e| Error::Internal(e.to_string()))?,
        remote_reference: row.try_get("remote_reference")?,
        created_at,
    })
}
