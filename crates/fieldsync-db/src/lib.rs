//! # fieldsync-db
//!
//! SQLite store for offline attachment capture.
//!
//! This crate provides:
//! - Reader and single-writer connection pools over one database file
//! - The attachment ledger and its state machine
//! - Owner photo lists behind a per-kind capability
//! - The append-only tombstone log
//! - The capture pipeline and delete reconciliation
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldsync_db::{Database, FilesystemBackend};
//!
//! let db = Database::open(&data_dir.join("fieldsync.sqlite3")).await?;
//! db.migrate().await?;
//!
//! let storage = Arc::new(FilesystemBackend::new(data_dir.join("attachments")));
//! let capture = db.capture_pipeline(storage.clone(), Arc::new(Notify::new()));
//! let attachment = capture
//!     .stage(&photo, &OwnerRef::schedule("sched-1"), PhotoKind::Before, MAX_CAPTURE_BYTES)
//!     .await?;
//! ```

pub mod attachments;
pub mod capture;
pub mod deletes;
pub mod file_storage;
pub mod owners;
pub mod pool;
pub mod tombstones;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) and downstream crates can use them
pub mod test_fixtures;

use std::path::Path;
use std::sync::Arc;

use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Notify;

// Re-export core types
pub use fieldsync_core::*;

pub use attachments::SqliteAttachmentLedger;
pub use capture::CapturePipeline;
pub use deletes::DeleteReconciler;
pub use file_storage::{compute_content_hash, FilesystemBackend, StorageBackend};
pub use owners::{JsonColumnOwner, OwnerRegistry, OwnerRepository, PhotoListOwner};
pub use pool::{create_pool_with_config, create_writer_pool, log_pool_metrics, PoolConfig};
pub use tombstones::SqliteTombstoneRepository;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// Reader pool for counts and listings.
    pub pool: SqlitePool,
    /// Single-connection pool every transaction goes through.
    pub writer: SqlitePool,
    /// Attachment ledger.
    pub attachments: SqliteAttachmentLedger,
    /// Owner records and photo lists.
    pub owners: OwnerRepository,
    /// Tombstone log.
    pub tombstones: SqliteTombstoneRepository,
}

impl Database {
    /// Create a Database from existing pools with the default owner kinds.
    pub fn new(pool: SqlitePool, writer: SqlitePool) -> Self {
        Self::with_registry(pool, writer, OwnerRegistry::default())
    }

    /// Create a Database with a custom owner registry.
    pub fn with_registry(pool: SqlitePool, writer: SqlitePool, registry: OwnerRegistry) -> Self {
        let registry = Arc::new(registry);
        Self {
            attachments: SqliteAttachmentLedger::new(
                pool.clone(),
                writer.clone(),
                Arc::clone(&registry),
            ),
            owners: OwnerRepository::new(pool.clone(), writer.clone(), registry),
            tombstones: SqliteTombstoneRepository::new(pool.clone(), writer.clone()),
            pool,
            writer,
        }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default()).await
    }

    /// Open with custom pool configuration.
    pub async fn open_with_config(path: &Path, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Writer first: it creates the file and switches it to WAL.
        let writer = create_writer_pool(path, &config).await?;
        let pool = create_pool_with_config(path, &config).await?;
        Ok(Self::new(pool, writer))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.writer)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Start a write transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.writer.begin().await?)
    }

    /// Get the reader pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Capture pipeline writing binaries to `storage` and notifying
    /// `upload_signal` when new work is staged.
    pub fn capture_pipeline(
        &self,
        storage: Arc<dyn StorageBackend>,
        upload_signal: Arc<Notify>,
    ) -> CapturePipeline {
        CapturePipeline::new(
            self.writer.clone(),
            self.attachments.clone(),
            self.owners.clone(),
            storage,
            upload_signal,
        )
    }

    /// Delete reconciler releasing binaries from `storage`.
    pub fn delete_reconciler(&self, storage: Arc<dyn StorageBackend>) -> DeleteReconciler {
        DeleteReconciler::new(
            self.writer.clone(),
            self.attachments.clone(),
            self.tombstones.clone(),
            Arc::clone(self.owners.registry()),
            storage,
        )
    }
}
