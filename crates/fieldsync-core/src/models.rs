//! Domain models for the attachment ledger, owner photo lists and tombstones.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

// =============================================================================
// OWNER ENTITIES
// =============================================================================

/// Kind of business record that owns a photo list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Schedule,
    Invoice,
}

impl OwnerKind {
    /// All owner kinds, in a stable order.
    pub const ALL: [OwnerKind; 2] = [OwnerKind::Schedule, OwnerKind::Invoice];

    /// Table holding records of this kind (and their `photos` column).
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Schedule => "schedules",
            Self::Invoice => "invoices",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Invoice => "invoice",
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OwnerKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "schedule" => Ok(Self::Schedule),
            "invoice" => Ok(Self::Invoice),
            _ => Err(format!("Invalid owner kind: {}", s)),
        }
    }
}

/// Which side of the job a photo documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoKind {
    Before,
    After,
}

impl PhotoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl std::fmt::Display for PhotoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhotoKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            _ => Err(format!("Invalid photo kind: {}", s)),
        }
    }
}

/// Identifies one owner record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub id: String,
}

impl OwnerRef {
    pub fn new(kind: OwnerKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn schedule(id: impl Into<String>) -> Self {
        Self::new(OwnerKind::Schedule, id)
    }

    pub fn invoice(id: impl Into<String>) -> Self {
        Self::new(OwnerKind::Invoice, id)
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// ATTACHMENT STATE MACHINE
// =============================================================================

/// Lifecycle state of one captured binary.
///
/// Persisted as an integer column; the discriminants are part of the on-disk
/// format and must not be renumbered.
///
/// ```text
/// QueuedUpload ──► Uploading ──► Synced
///      ▲  │            │
///      │  └──► Failed ◄┘
///      └────────┘
/// (any) ──► QueuedDelete ──► removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentState {
    QueuedUpload = 0,
    Uploading = 1,
    Synced = 2,
    QueuedDelete = 3,
    Failed = 4,
}

impl AttachmentState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::QueuedUpload),
            1 => Some(Self::Uploading),
            2 => Some(Self::Synced),
            3 => Some(Self::QueuedDelete),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    /// States in which the row's local binary must exist on disk.
    pub fn requires_local_binary(self) -> bool {
        matches!(self, Self::QueuedUpload | Self::Uploading | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Self-transitions are not listed here; the ledger treats them as
    /// no-ops before consulting this table.
    pub fn can_transition_to(self, next: Self) -> bool {
        use AttachmentState::*;
        match (self, next) {
            (_, QueuedDelete) => self != QueuedDelete,
            (QueuedUpload, Uploading) => true,
            (QueuedUpload | Uploading, Synced) => true,
            (QueuedUpload | Uploading, Failed) => true,
            (Failed | Uploading, QueuedUpload) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueuedUpload => write!(f, "QUEUED_UPLOAD"),
            Self::Uploading => write!(f, "UPLOADING"),
            Self::Synced => write!(f, "SYNCED"),
            Self::QueuedDelete => write!(f, "QUEUED_DELETE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome of a single state-transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row moved to the requested state.
    Applied,
    /// The row was already in the requested state; nothing was written.
    Unchanged,
    /// The row is in a state the request may not move it out of.
    Rejected(AttachmentState),
    /// No row with that id exists.
    Missing,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

// =============================================================================
// ATTACHMENT LEDGER
// =============================================================================

/// One captured binary tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub photo_kind: PhotoKind,
    /// Upload key: `{id}.{ext}`. Used as the remote name unless the remote
    /// assigns a different one.
    pub filename: String,
    /// Attachment-owned copy of the binary. `None` once released.
    pub local_path: Option<PathBuf>,
    /// Name assigned by the remote store. `None` while pending.
    pub remote_filename: Option<String>,
    pub state: AttachmentState,
    pub content_type: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attachment {
    /// Best reference to this binary as the remote service knows it.
    pub fn remote_reference(&self) -> &str {
        self.remote_filename.as_deref().unwrap_or(&self.filename)
    }
}

/// Row data for inserting a freshly staged attachment.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub photo_kind: PhotoKind,
    pub filename: String,
    pub local_path: PathBuf,
    pub content_type: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// OWNER PHOTO LIST
// =============================================================================

/// Upload badge shown next to a photo in the owner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhotoStatus {
    #[default]
    Pending,
    Uploaded,
    Failed,
}

impl PhotoStatus {
    /// Badge implied by a ledger state. `QueuedDelete` rows are no longer listed.
    pub fn for_state(state: AttachmentState) -> Option<Self> {
        match state {
            AttachmentState::QueuedUpload | AttachmentState::Uploading => Some(Self::Pending),
            AttachmentState::Synced => Some(Self::Uploaded),
            AttachmentState::Failed => Some(Self::Failed),
            AttachmentState::QueuedDelete => None,
        }
    }
}

impl std::fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One element of an owner record's denormalized `photos` JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoEntry {
    pub id: Uuid,
    /// Remote filename once uploaded, the upload key before that.
    pub url_or_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_uri: Option<String>,
    #[serde(rename = "type")]
    pub photo_kind: PhotoKind,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub status: PhotoStatus,
    pub owner_id: String,
}

impl PhotoEntry {
    /// Entry appended to the owner's list when `attachment` is staged.
    pub fn for_attachment(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id,
            url_or_filename: attachment.filename.clone(),
            local_uri: attachment
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            photo_kind: attachment.photo_kind,
            timestamp: attachment.created_at.timestamp_millis(),
            status: PhotoStatus::Pending,
            owner_id: attachment.owner.id.clone(),
        }
    }
}

// =============================================================================
// TOMBSTONES
// =============================================================================

/// Append-only record that a remote binary must be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOperation {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub attachment_id: Uuid,
    /// URL/filename as last known to the remote service.
    pub remote_reference: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CAPTURE / DELETE REQUESTS
// =============================================================================

/// One source binary offered to the capture pipeline.
#[derive(Debug, Clone)]
pub struct CaptureInput {
    pub source: PathBuf,
    pub photo_kind: PhotoKind,
}

impl CaptureInput {
    pub fn new(source: impl Into<PathBuf>, photo_kind: PhotoKind) -> Self {
        Self {
            source: source.into(),
            photo_kind,
        }
    }
}

/// An input the pipeline refused, with the reason.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub source: PathBuf,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone)]
pub enum RejectionReason {
    /// Failed validation (missing, oversized, blocked).
    Invalid(ValidationError),
    /// Reading or copying the source failed.
    Unreadable(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(e) => write!(f, "{}", e),
            Self::Unreadable(msg) => write!(f, "unreadable: {}", msg),
        }
    }
}

/// Result of staging a batch of inputs.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub staged: Vec<Attachment>,
    pub rejected: Vec<Rejection>,
}

impl BatchOutcome {
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

/// What a delete request actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The photo-list entry was present and has been removed.
    pub entry_removed: bool,
    /// A new tombstone was appended by this call.
    pub tombstone_written: bool,
    /// The local ledger row moved to QUEUED_DELETE in this call.
    pub row_marked: bool,
    /// The local binary was deleted from disk.
    pub binary_released: bool,
}

impl DeleteOutcome {
    /// Nothing was left to delete: the request was already satisfied.
    pub fn already_satisfied(&self) -> bool {
        !self.entry_removed && !self.tombstone_written && !self.row_marked
    }
}

// =============================================================================
// SYNC / PROGRESS
// =============================================================================

/// What one invocation of the remote-sync primitive accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub uploaded: u64,
    pub failed: u64,
    /// Items put back after a transient transport error.
    pub deferred: u64,
    pub tombstones_applied: u64,
}

/// Upload progress within the current scheduler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub uploaded: u64,
    pub total: u64,
}

/// Snapshot exposed to the UI layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub pending: u64,
    pub failed: u64,
    pub is_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_state_integer_round_trip() {
        for state in [
            AttachmentState::QueuedUpload,
            AttachmentState::Uploading,
            AttachmentState::Synced,
            AttachmentState::QueuedDelete,
            AttachmentState::Failed,
        ] {
            assert_eq!(AttachmentState::from_i64(state.as_i64()), Some(state));
        }
        assert_eq!(AttachmentState::from_i64(99), None);
    }

    #[test]
    fn test_attachment_state_discriminants_are_stable() {
        assert_eq!(AttachmentState::QueuedUpload.as_i64(), 0);
        assert_eq!(AttachmentState::Uploading.as_i64(), 1);
        assert_eq!(AttachmentState::Synced.as_i64(), 2);
        assert_eq!(AttachmentState::QueuedDelete.as_i64(), 3);
        assert_eq!(AttachmentState::Failed.as_i64(), 4);
    }

    #[test]
    fn test_success_path_transitions() {
        use AttachmentState::*;
        assert!(QueuedUpload.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Uploading));
        assert!(!Synced.can_transition_to(QueuedUpload));
    }

    #[test]
    fn test_retry_path_transitions() {
        use AttachmentState::*;
        assert!(QueuedUpload.can_transition_to(Failed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(QueuedUpload));
        assert!(!Failed.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Failed));
    }

    #[test]
    fn test_delete_path_from_any_state() {
        use AttachmentState::*;
        for state in [QueuedUpload, Uploading, Synced, Failed] {
            assert!(state.can_transition_to(QueuedDelete), "{state}");
        }
        assert!(!QueuedDelete.can_transition_to(QueuedDelete));
        assert!(!QueuedDelete.can_transition_to(QueuedUpload));
        assert!(!QueuedDelete.can_transition_to(Synced));
    }

    #[test]
    fn test_requires_local_binary() {
        use AttachmentState::*;
        assert!(QueuedUpload.requires_local_binary());
        assert!(Uploading.requires_local_binary());
        assert!(Failed.requires_local_binary());
        assert!(!Synced.requires_local_binary());
        assert!(!QueuedDelete.requires_local_binary());
    }

    #[test]
    fn test_photo_status_for_state() {
        use AttachmentState::*;
        assert_eq!(PhotoStatus::for_state(QueuedUpload), Some(PhotoStatus::Pending));
        assert_eq!(PhotoStatus::for_state(Uploading), Some(PhotoStatus::Pending));
        assert_eq!(PhotoStatus::for_state(Synced), Some(PhotoStatus::Uploaded));
        assert_eq!(PhotoStatus::for_state(Failed), Some(PhotoStatus::Failed));
        assert_eq!(PhotoStatus::for_state(QueuedDelete), None);
    }

    #[test]
    fn test_photo_entry_json_shape() {
        let entry = PhotoEntry {
            id: Uuid::nil(),
            url_or_filename: "abc.jpg".to_string(),
            local_uri: None,
            photo_kind: PhotoKind::Before,
            timestamp: 1_700_000_000_000,
            status: PhotoStatus::Pending,
            owner_id: "sched-1".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "before");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["owner_id"], "sched-1");
        assert!(json.get("local_uri").is_none());
    }

    #[test]
    fn test_photo_entry_status_defaults_to_pending() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","url_or_filename":"a.jpg",
                       "type":"after","timestamp":1,"owner_id":"inv-1"}"#;
        let entry: PhotoEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.status, PhotoStatus::Pending);
        assert_eq!(entry.photo_kind, PhotoKind::After);
    }

    #[test]
    fn test_owner_kind_parse_and_table() {
        assert_eq!("Schedule".parse::<OwnerKind>().unwrap(), OwnerKind::Schedule);
        assert_eq!("invoice".parse::<OwnerKind>().unwrap(), OwnerKind::Invoice);
        assert!("job".parse::<OwnerKind>().is_err());
        assert_eq!(OwnerKind::Schedule.table_name(), "schedules");
        assert_eq!(OwnerKind::Invoice.table_name(), "invoices");
    }

    #[test]
    fn test_delete_outcome_already_satisfied() {
        assert!(DeleteOutcome::default().already_satisfied());
        let outcome = DeleteOutcome {
            tombstone_written: true,
            ..Default::default()
        };
        assert!(!outcome.already_satisfied());
    }
}
