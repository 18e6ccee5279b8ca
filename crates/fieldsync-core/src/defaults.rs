//! Centralized default constants for fieldsync.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs in the other crates start from these and let environment
//! variables override them.

// =============================================================================
// CAPTURE
// =============================================================================

/// Maximum accepted size of one captured binary (20 MiB).
pub const MAX_CAPTURE_BYTES: u64 = 20 * 1024 * 1024;

/// Bytes read from the head of a source binary for magic-byte detection.
pub const CONTENT_SNIFF_BYTES: usize = 8 * 1024;

/// Content type assumed when neither magic bytes nor extension identify one.
pub const FALLBACK_CONTENT_TYPE: &str = "image/jpeg";

/// Directory (relative to the data dir) holding attachment-owned binaries.
pub const ATTACHMENTS_DIR: &str = "attachments";

// =============================================================================
// STORE
// =============================================================================

/// SQLite database file name inside the data dir.
pub const DATABASE_FILE: &str = "fieldsync.sqlite3";

/// Default maximum number of reader connections.
pub const DB_MAX_CONNECTIONS: u32 = 4;

/// SQLite busy timeout in milliseconds.
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Rows fetched per page when the sync pass walks the queue.
pub const SYNC_PAGE_SIZE: i64 = 50;

// =============================================================================
// UPLOAD SCHEDULER
// =============================================================================

/// Wait between scheduler iterations while uploads remain pending.
pub const SYNC_INTERVAL_MS: u64 = 2_000;

/// First delay before re-triggering after a failed run.
pub const SYNC_RETRY_BACKOFF_MS: u64 = 5_000;

/// Upper bound on the re-trigger delay.
pub const SYNC_RETRY_BACKOFF_MAX_MS: u64 = 300_000;

/// Failed runs in a row after which only an external trigger restarts the scheduler.
pub const SYNC_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// REMOTE
// =============================================================================

/// Timeout for a single remote request in seconds.
pub const REMOTE_TIMEOUT_SECS: u64 = 30;
