//! # fieldsync-app
//!
//! Service facade over the attachment store and the upload scheduler.
//!
//! [`FieldSync`] is what the UI layer talks to: it stages captures, deletes
//! photos, exposes upload status and progress, and lets the host nudge or
//! cancel the background scheduler.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldsync_app::{AppConfig, FieldSync};
//!
//! let app = FieldSync::open(AppConfig::from_env()).await?;
//! let owner = OwnerRef::schedule("sched-1");
//! app.create_owner(&owner, "Boiler service").await?;
//!
//! let attachment = app.stage(&photo_path, &owner, PhotoKind::Before).await?;
//!
//! let mut status = app.status_stream();
//! while let Some(status) = status.next().await {
//!     println!("{} pending, {} failed", status.pending, status.failed);
//! }
//! ```

pub mod config;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::AppConfig;
pub use fieldsync_core::*;

use fieldsync_db::{
    CapturePipeline, Database, DeleteReconciler, FilesystemBackend, StorageBackend,
};
use fieldsync_jobs::{
    AttachmentSyncPass, HttpRemoteStore, RunOutcome, SchedulerEvent, SchedulerHandle,
    UploadScheduler,
};

/// Stand-in primitive when no remote service is configured.
struct Offline;

#[async_trait]
impl SyncPrimitive for Offline {
    async fn sync_pending(&self) -> Result<SyncReport> {
        Err(Error::Sync("no remote service configured".into()))
    }
}

/// The attachment subsystem, wired together.
pub struct FieldSync {
    config: AppConfig,
    db: Database,
    capture: CapturePipeline,
    deletes: DeleteReconciler,
    scheduler: SchedulerHandle,
}

impl FieldSync {
    /// Open the store under `config.data_dir` and start the scheduler
    /// against the configured HTTP remote.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let remote: Option<Arc<dyn RemoteStore>> = match &config.remote {
            Some(remote) => Some(Arc::new(HttpRemoteStore::new(remote.clone())?)),
            None => None,
        };
        Self::open_with_remote(config, remote).await
    }

    /// Open against any [`RemoteStore`]. `None` runs offline: the
    /// scheduler is not started and captures stay queued.
    pub async fn open_with_remote(
        mut config: AppConfig,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Result<Self> {
        let db = Database::open_with_config(&config.database_path(), config.pool.clone()).await?;
        db.migrate().await?;

        let backend = FilesystemBackend::new(config.attachments_dir());
        backend.validate().await.map_err(Error::Config)?;
        let storage: Arc<dyn StorageBackend> = Arc::new(backend);

        let primitive: Arc<dyn SyncPrimitive> = match remote {
            Some(remote) => Arc::new(AttachmentSyncPass::new(db.clone(), storage.clone(), remote)),
            None => {
                warn!("No remote service configured, uploads stay queued");
                config.scheduler.enabled = false;
                Arc::new(Offline)
            }
        };

        let upload_signal = Arc::new(Notify::new());
        let capture = db.capture_pipeline(storage.clone(), Arc::clone(&upload_signal));
        let deletes = db.delete_reconciler(storage.clone());
        let scheduler = UploadScheduler::new(
            db.clone(),
            db.delete_reconciler(storage),
            primitive,
            config.scheduler.clone(),
            upload_signal,
        )
        .start();

        info!(
            data_dir = %config.data_dir.display(),
            max_capture_bytes = config.max_capture_bytes,
            scheduler_enabled = config.scheduler.enabled,
            "FieldSync opened"
        );

        Ok(Self {
            config,
            db,
            capture,
            deletes,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -------------------------------------------------------------------------
    // Capture and delete
    // -------------------------------------------------------------------------

    /// Stage one captured photo for upload.
    pub async fn stage(
        &self,
        source: &Path,
        owner: &OwnerRef,
        photo_kind: PhotoKind,
    ) -> Result<Attachment> {
        self.capture
            .stage(source, owner, photo_kind, self.config.max_capture_bytes)
            .await
    }

    /// Stage several photos; invalid inputs are reported, not fatal.
    pub async fn stage_batch(
        &self,
        owner: &OwnerRef,
        inputs: &[CaptureInput],
    ) -> Result<BatchOutcome> {
        self.capture
            .stage_batch(owner, inputs, self.config.max_capture_bytes)
            .await
    }

    pub async fn request_delete(
        &self,
        owner: &OwnerRef,
        attachment_id: Uuid,
        last_known_remote_ref: Option<&str>,
    ) -> Result<DeleteOutcome> {
        self.deletes
            .request_delete(owner, attachment_id, last_known_remote_ref)
            .await
    }

    // -------------------------------------------------------------------------
    // Upload scheduling
    // -------------------------------------------------------------------------

    /// Ask for an upload run now.
    pub fn check_pending_uploads(&self) {
        self.scheduler.trigger();
    }

    /// The host app came back to the foreground.
    pub fn on_foreground_resume(&self) {
        debug!("Foreground resume, checking pending uploads");
        self.scheduler.trigger();
    }

    /// Stop the active upload run between iterations.
    pub fn cancel_pending_uploads(&self) {
        self.scheduler.cancel_pending_uploads();
    }

    /// Run the upload loop to completion on the caller's task.
    ///
    /// Returns [`RunOutcome::AlreadyRunning`] if the background scheduler is
    /// mid-run.
    pub async fn sync_now(&self) -> RunOutcome {
        self.scheduler.scheduler().run_once().await
    }

    pub async fn status(&self) -> Result<UploadStatus> {
        self.scheduler.status().await
    }

    pub fn is_uploading(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Every scheduler event. Lagging subscribers skip what they missed.
    pub fn events(&self) -> impl Stream<Item = SchedulerEvent> {
        BroadcastStream::new(self.scheduler.events()).filter_map(|result| result.ok())
    }

    /// `{pending, failed, is_running}` snapshots, one per scheduler iteration.
    pub fn status_stream(&self) -> impl Stream<Item = UploadStatus> {
        self.events().filter_map(|event| match event {
            SchedulerEvent::Status(status) => Some(status),
            _ => None,
        })
    }

    /// Per-cycle `{uploaded, total}` progress.
    pub fn progress_stream(&self) -> impl Stream<Item = UploadProgress> {
        self.events().filter_map(|event| match event {
            SchedulerEvent::Progress(progress) => Some(progress),
            _ => None,
        })
    }

    // -------------------------------------------------------------------------
    // Owner records
    // -------------------------------------------------------------------------

    /// Create an owner record if it does not exist yet.
    pub async fn create_owner(&self, owner: &OwnerRef, title: &str) -> Result<bool> {
        self.db.owners.create(owner, title).await
    }

    pub async fn photos(&self, owner: &OwnerRef) -> Result<Vec<PhotoEntry>> {
        self.db.owners.photos(owner).await
    }

    pub async fn attachments(&self, owner: &OwnerRef) -> Result<Vec<Attachment>> {
        self.db.attachments.list_for_owner(owner).await
    }

    /// Stop the scheduler. An in-flight sync call completes first.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down FieldSync");
        self.scheduler.shutdown().await
    }
}
