//! UUID v7 utilities for time-ordered identifiers.
//!
//! Attachment ids and tombstone ids are UUIDv7 so that ledger rows sort in
//! capture order and the sync pass uploads oldest photos first.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use fieldsync_core::uuid_utils::{is_v7, new_v7};
///
/// let id = new_v7();
/// assert!(is_v7(&id));
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check whether a UUID is version 7.
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}
