//! Owner records and their denormalized photo lists.
//!
//! Schedules and invoices both carry a `photos` JSON array. Everything that
//! edits that array goes through [`PhotoListOwner`], so adding a third owner
//! kind means adding one implementation and registering it, not touching the
//! capture or delete code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use fieldsync_core::{Error, OwnerKind, OwnerRef, PhotoEntry, Result};

/// Read/write access to one owner kind's photo list.
///
/// Every method takes a connection so callers can run it inside the
/// transaction that also touches the attachment ledger.
#[async_trait]
pub trait PhotoListOwner: Send + Sync {
    fn kind(&self) -> OwnerKind;

    /// Whether an owner record with this id exists.
    async fn exists(&self, conn: &mut SqliteConnection, owner_id: &str) -> Result<bool>;

    /// Current photo list, or `None` if the owner record does not exist.
    async fn read_photos(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
    ) -> Result<Option<Vec<PhotoEntry>>>;

    /// Replace the photo list. Fails with `OwnerNotFound` if the record is gone.
    async fn write_photos(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
        photos: &[PhotoEntry],
    ) -> Result<()>;
}

/// Photo list stored as a JSON text column on the owner's own table.
pub struct JsonColumnOwner {
    kind: OwnerKind,
}

impl JsonColumnOwner {
    pub fn new(kind: OwnerKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl PhotoListOwner for JsonColumnOwner {
    fn kind(&self) -> OwnerKind {
        self.kind
    }

    async fn exists(&self, conn: &mut SqliteConnection, owner_id: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1", self.kind.table_name());
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    async fn read_photos(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
    ) -> Result<Option<Vec<PhotoEntry>>> {
        let sql = format!("SELECT photos FROM {} WHERE id = ?1", self.kind.table_name());
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get("photos")?;
                Ok(Some(parse_photo_list(&raw)?))
            }
        }
    }

    async fn write_photos(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
        photos: &[PhotoEntry],
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET photos = ?1, updated_at = ?2 WHERE id = ?3",
            self.kind.table_name()
        );
        let raw = serde_json::to_string(photos)?;
        let result = sqlx::query(&sql)
            .bind(raw)
            .bind(Utc::now())
            .bind(owner_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::OwnerNotFound {
                kind: self.kind,
                id: owner_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Empty or blank columns read as an empty list.
fn parse_photo_list(raw: &str) -> Result<Vec<PhotoEntry>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Photo-list capability for each owner kind.
#[derive(Clone)]
pub struct OwnerRegistry {
    owners: HashMap<OwnerKind, Arc<dyn PhotoListOwner>>,
}

impl Default for OwnerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            owners: HashMap::new(),
        };
        for kind in OwnerKind::ALL {
            registry.register(Arc::new(JsonColumnOwner::new(kind)));
        }
        registry
    }
}

impl OwnerRegistry {
    /// Replace the capability for `owner.kind()`.
    pub fn register(&mut self, owner: Arc<dyn PhotoListOwner>) {
        self.owners.insert(owner.kind(), owner);
    }

    pub fn get(&self, kind: OwnerKind) -> Result<&dyn PhotoListOwner> {
        self.owners
            .get(&kind)
            .map(|o| o.as_ref())
            .ok_or_else(|| Error::Internal(format!("no photo list registered for {}", kind)))
    }
}

/// Apply `update` to the entry for `attachment_id` and write the list back.
///
/// Returns `false` without writing when the owner or the entry is gone.
pub async fn update_photo_entry<F>(
    owners: &OwnerRegistry,
    conn: &mut SqliteConnection,
    owner: &OwnerRef,
    attachment_id: Uuid,
    update: F,
) -> Result<bool>
where
    F: FnOnce(&mut PhotoEntry) + Send,
{
    let list = owners.get(owner.kind)?;
    let Some(mut photos) = list.read_photos(conn, &owner.id).await? else {
        debug!(owner = %owner, attachment_id = %attachment_id, "Owner gone, photo entry not updated");
        return Ok(false);
    };
    let Some(entry) = photos.iter_mut().find(|p| p.id == attachment_id) else {
        debug!(owner = %owner, attachment_id = %attachment_id, "Photo entry gone, not updated");
        return Ok(false);
    };
    update(entry);
    list.write_photos(conn, &owner.id, &photos).await?;
    Ok(true)
}

/// Owner record lifecycle.
///
/// The app's own sync layer owns these records; this repository exists for
/// the CLI and for tests that need owners to attach photos to.
#[derive(Clone)]
pub struct OwnerRepository {
    pool: SqlitePool,
    writer: SqlitePool,
    registry: Arc<OwnerRegistry>,
}

impl OwnerRepository {
    pub fn new(pool: SqlitePool, writer: SqlitePool, registry: Arc<OwnerRegistry>) -> Self {
        Self {
            pool,
            writer,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<OwnerRegistry> {
        &self.registry
    }

    /// Create an owner record with an empty photo list. Existing records are left alone.
    pub async fn create(&self, owner: &OwnerRef, title: &str) -> Result<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, title, photos, created_at, updated_at) \
             VALUES (?1, ?2, '[]', ?3, ?3)",
            owner.kind.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(&owner.id)
            .bind(title)
            .bind(Utc::now())
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn exists(&self, owner: &OwnerRef) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        self.registry
            .get(owner.kind)?
            .exists(&mut conn, &owner.id)
            .await
    }

    /// Photo list of an owner, failing with `OwnerNotFound` if the record is gone.
    pub async fn photos(&self, owner: &OwnerRef) -> Result<Vec<PhotoEntry>> {
        let mut conn = self.pool.acquire().await?;
        self.registry
            .get(owner.kind)?
            .read_photos(&mut conn, &owner.id)
            .await?
            .ok_or_else(|| Error::OwnerNotFound {
                kind: owner.kind,
                id: owner.id.clone(),
            })
    }

    /// Remove the owner record. Attachments it owned stay in the ledger
    /// and are no longer requeued after a failure.
    pub async fn delete(&self, owner: &OwnerRef) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", owner.kind.table_name());
        let result = sqlx::query(&sql)
            .bind(&owner.id)
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
