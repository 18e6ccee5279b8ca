//! # fieldsync-core
//!
//! Core types, traits, and abstractions for offline attachment capture.
//!
//! This crate provides the foundational data structures (the attachment
//! ledger row, its state machine, the denormalized photo list entry, delete
//! tombstones) and the trait seams that the store, the upload scheduler, and
//! the remote collaborator plug into.

pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result, ValidationError};
pub use file_safety::{detect_content_type, extension_for_mime, validate_header, ValidationResult};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{is_v7, new_v7};
