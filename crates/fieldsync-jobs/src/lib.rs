//! # fieldsync-jobs
//!
//! Background upload scheduling for fieldsync.
//!
//! This crate provides:
//! - The remote-sync primitive: push queued binaries, then apply tombstones
//! - An HTTP transport for the remote attachment service
//! - A single-flight upload scheduler with progress events, cancellation
//!   and retry backoff
//!
//! ## Example
//!
//! ```ignore
//! use fieldsync_jobs::{AttachmentSyncPass, HttpRemoteConfig, HttpRemoteStore};
//! use fieldsync_jobs::{SchedulerConfig, UploadScheduler};
//!
//! let remote = Arc::new(HttpRemoteStore::new(HttpRemoteConfig::new("https://api.example"))?);
//! let pass = Arc::new(AttachmentSyncPass::new(db.clone(), storage.clone(), remote));
//!
//! let scheduler = UploadScheduler::new(
//!     db.clone(),
//!     db.delete_reconciler(storage),
//!     pass,
//!     SchedulerConfig::from_env(),
//!     upload_signal,
//! );
//! let handle = scheduler.start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod http;
pub mod scheduler;
pub mod sync;

// Re-export core types
pub use fieldsync_core::*;

pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use scheduler::{RunOutcome, SchedulerConfig, SchedulerEvent, SchedulerHandle, UploadScheduler};
pub use sync::AttachmentSyncPass;
