//! Test fixtures for store integration tests.
//!
//! Every [`TestStore`] is a fresh SQLite file in its own temporary
//! directory, so tests never share state and need no external database.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_db::test_fixtures::TestStore;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let store = TestStore::new().await;
//!     let owner = store.schedule("sched-1").await;
//!     let source = store.write_jpeg("IMG_0001.jpg");
//!
//!     let staged = store.capture().stage(&source, &owner, PhotoKind::Before, 1024).await;
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
    CapturePipeline, Database, DeleteReconciler, FilesystemBackend, OwnerRef, PoolConfig,
};
use fieldsync_core::defaults::{ATTACHMENTS_DIR, DATABASE_FILE};

/// Minimal JPEG header followed by filler bytes.
pub fn jpeg_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00];
    data.resize(len.max(data.len()), 0xAB);
    data
}

/// Minimal PNG signature followed by filler bytes.
pub fn png_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    data.resize(len.max(data.len()), 0x00);
    data
}

/// A migrated store in a temporary directory.
pub struct TestStore {
    pub dir: TempDir,
    pub db: Database,
    pub storage: Arc<FilesystemBackend>,
    pub upload_signal: Arc<Notify>,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = Database::open_with_config(
            &dir.path().join(DATABASE_FILE),
            PoolConfig::new().max_connections(2),
        )
        .await
        .expect("Failed to open test database");
        db.migrate().await.expect("Failed to run migrations");

        let storage = Arc::new(FilesystemBackend::new(dir.path().join(ATTACHMENTS_DIR)));
        Self {
            dir,
            db,
            storage,
            upload_signal: Arc::new(Notify::new()),
        }
    }

    pub fn capture(&self) -> CapturePipeline {
        self.db
            .capture_pipeline(self.storage.clone(), Arc::clone(&self.upload_signal))
    }

    pub fn deletes(&self) -> DeleteReconciler {
        self.db.delete_reconciler(self.storage.clone())
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.dir.path().join(ATTACHMENTS_DIR)
    }

    /// Create a schedule owner.
    pub async fn schedule(&self, id: &str) -> OwnerRef {
        let owner = OwnerRef::schedule(id);
        self.db
            .owners
            .create(&owner, "test schedule")
            .await
            .expect("Failed to create schedule");
        owner
    }

    /// Create an invoice owner.
    pub async fn invoice(&self, id: &str) -> OwnerRef {
        let owner = OwnerRef::invoice(id);
        self.db
            .owners
            .create(&owner, "test invoice")
            .await
            .expect("Failed to create invoice");
        owner
    }

    /// Write a capture source outside the attachments directory.
    pub fn write_source(&self, name: &str, data: &[u8]) -> PathBuf {
        let sources = self.dir.path().join("sources");
        std::fs::create_dir_all(&sources).expect("Failed to create sources dir");
        let path = sources.join(name);
        std::fs::write(&path, data).expect("Failed to write source");
        path
    }

    pub fn write_jpeg(&self, name: &str) -> PathBuf {
        self.write_source(name, &jpeg_bytes(512))
    }

    /// Number of files currently in the attachments directory.
    pub fn stored_file_count(&self) -> usize {
        match std::fs::read_dir(self.attachments_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .count(),
            Err(_) => 0,
        }
    }

    /// Make every UPDATE on `table` abort, to force a transaction to fail
    /// partway through.
    pub async fn fail_updates_on(&self, table: &str) {
        let sql = format!(
            "CREATE TRIGGER fail_updates_{table} BEFORE UPDATE ON {table} \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END"
        );
        sqlx::query(&sql)
            .execute(&self.db.writer)
            .await
            .expect("Failed to install failure trigger");
    }

    /// Make every DELETE on `table` silently do nothing.
    pub async fn ignore_deletes_on(&self, table: &str) {
        let sql = format!(
            "CREATE TRIGGER ignore_deletes_{table} BEFORE DELETE ON {table} \
             BEGIN SELECT RAISE(IGNORE); END"
        );
        sqlx::query(&sql)
            .execute(&self.db.writer)
            .await
            .expect("Failed to install ignore trigger");
    }

    pub async fn clear_failure_on(&self, table: &str) {
        let sql = format!("DROP TRIGGER IF EXISTS fail_updates_{table}");
        sqlx::query(&sql)
            .execute(&self.db.writer)
            .await
            .expect("Failed to drop failure trigger");
    }
}
