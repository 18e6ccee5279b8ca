//! Core traits for the seams between the local subsystem and its remote
//! collaborator.
//!
//! The upload scheduler only ever sees a [`SyncPrimitive`]. The default
//! primitive (the sync pass in `fieldsync-jobs`) talks to a [`RemoteStore`].
//! Tests and alternative transports implement either trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{DeleteOperation, PhotoKind, SyncReport};

/// One binary ready to be sent to the remote store.
#[derive(Debug, Clone)]
pub struct RemoteUpload {
    pub attachment_id: Uuid,
    pub owner_id: String,
    pub photo_kind: PhotoKind,
    /// Upload key (`{id}.{ext}`).
    pub filename: String,
    pub content_type: String,
    pub content_hash: String,
    pub data: Vec<u8>,
}

/// Transport to the remote attachment service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability check. An error here means the whole sync pass
    /// cannot make progress.
    async fn probe(&self) -> Result<()>;

    /// Upload one binary and return the filename the remote assigned.
    async fn upload(&self, upload: RemoteUpload) -> Result<String>;

    /// Delete the remote copy named by a tombstone. Deleting something the
    /// remote does not have must succeed.
    async fn delete(&self, tombstone: &DeleteOperation) -> Result<()>;
}

/// The remote-sync primitive driven by the upload scheduler.
///
/// One call attempts every queued upload and every unconsumed tombstone,
/// progressing ledger state for the items that succeed. It returns an error
/// only when the call failed as a whole (for example no network).
#[async_trait]
pub trait SyncPrimitive: Send + Sync {
    async fn sync_pending(&self) -> Result<SyncReport>;
}
