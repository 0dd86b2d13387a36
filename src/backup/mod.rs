pub mod export;
pub mod progress;
pub mod restore;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use export::*;
pub use progress::*;
pub use restore::*;
pub use service::*;
pub use snapshot::*;
pub use store::*;
pub use verify::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Origin tag recorded on every backup for audit purposes.
pub const TRIGGER_MANUAL: &str = "manual";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory where backup artifacts are stored
    pub artifact_directory: PathBuf,

    /// zstd compression level for compressed artifacts
    pub compression_level: i32,

    /// How long finished restore progress records are kept before eviction
    pub progress_retention_minutes: i64,

    /// Tables the live store is expected to contain; verified against
    /// every full artifact's manifest
    pub expected_tables: Vec<String>,

    /// Minimum row counts per table enforced during artifact verification
    pub row_count_floors: HashMap<String, u64>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            artifact_directory: PathBuf::from("/var/lib/taskvault/backups"),
            compression_level: 3,
            progress_retention_minutes: 30,
            expected_tables: Vec::new(),
            row_count_floors: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(BackupError::Validation(format!(
                "unknown backup type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Corrupted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Corrupted => "corrupted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            "corrupted" => Ok(BackupStatus::Corrupted),
            other => Err(BackupError::Validation(format!(
                "unknown backup status: {other}"
            ))),
        }
    }

    /// Terminal records never leave their state again, except for deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Corrupted
        )
    }
}

/// One record per backup artifact in the metadata catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub parent_backup_id: Option<String>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub file_path: Option<PathBuf>,
    pub compressed: bool,
    /// Change-log position captured by this backup's snapshot.
    pub snapshot_seq: Option<i64>,
    /// Change-log position the delta starts after (incremental only).
    pub delta_start_seq: Option<i64>,
    /// `manual`, or the id of the schedule that produced this backup.
    pub triggered_by: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupMetadata {
    pub fn new_pending(
        backup_type: BackupType,
        name: String,
        description: Option<String>,
        parent_backup_id: Option<String>,
        compressed: bool,
        triggered_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            backup_type,
            status: BackupStatus::Pending,
            parent_backup_id,
            size_bytes: 0,
            checksum: None,
            file_path: None,
            compressed,
            snapshot_seq: None,
            delta_start_seq: None,
            triggered_by,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Options accepted by the create-backup operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBackupOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub compress: Option<bool>,
    pub verify: Option<bool>,
    pub parent_backup_id: Option<String>,
    /// Audit origin; never taken from request payloads.
    #[serde(skip)]
    pub triggered_by: Option<String>,
}

impl CreateBackupOptions {
    pub fn compress(&self) -> bool {
        self.compress.unwrap_or(true)
    }

    pub fn verify(&self) -> bool {
        self.verify.unwrap_or(true)
    }

    pub fn source(&self) -> String {
        self.triggered_by
            .clone()
            .unwrap_or_else(|| TRIGGER_MANUAL.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub verify: Option<bool>,
    pub point_in_time: Option<DateTime<Utc>>,
    pub preserve_existing: Option<bool>,
}

impl RestoreOptions {
    pub fn verify(&self) -> bool {
        self.verify.unwrap_or(true)
    }

    pub fn preserve_existing(&self) -> bool {
        self.preserve_existing.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialRestoreOptions {
    pub tables: Vec<String>,
    pub include_schema: Option<bool>,
    pub preserve_existing: Option<bool>,
    pub validate_after: Option<bool>,
    pub verify: Option<bool>,
    pub point_in_time: Option<DateTime<Utc>>,
    /// Accept restored rows that reference un-restored tables with no
    /// matching live row. Off by default; the restore is rejected instead.
    pub allow_dangling_references: Option<bool>,
}

impl PartialRestoreOptions {
    pub fn include_schema(&self) -> bool {
        self.include_schema.unwrap_or(false)
    }

    pub fn preserve_existing(&self) -> bool {
        self.preserve_existing.unwrap_or(false)
    }

    pub fn validate_after(&self) -> bool {
        self.validate_after.unwrap_or(true)
    }

    pub fn verify(&self) -> bool {
        self.verify.unwrap_or(true)
    }

    pub fn allow_dangling_references(&self) -> bool {
        self.allow_dangling_references.unwrap_or(false)
    }
}

/// Outcome summary returned by every restore variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub backup_id: String,
    pub restored_to: DateTime<Utc>,
    pub tables_restored: Vec<String>,
    pub rows_applied: u64,
    pub changes_replayed: u64,
    pub pre_restore_backup_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("engine error: {message}")]
    Engine { message: String },
}

impl BackupError {
    pub fn engine(message: impl Into<String>) -> Self {
        BackupError::Engine {
            message: message.into(),
        }
    }

    /// Stable error category surfaced alongside the human-readable message.
    pub fn category(&self) -> &'static str {
        match self {
            BackupError::Validation(_) => "validation",
            BackupError::NotFound(_) => "not_found",
            BackupError::Conflict(_) => "conflict",
            BackupError::Integrity(_) => "integrity",
            BackupError::Database(_) | BackupError::Io(_) | BackupError::Serialization(_) => {
                "engine"
            }
            BackupError::Engine { .. } => "engine",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_status_round_trip() {
        for status in [
            BackupStatus::Pending,
            BackupStatus::InProgress,
            BackupStatus::Completed,
            BackupStatus::Failed,
            BackupStatus::Corrupted,
        ] {
            assert_eq!(BackupStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(BackupStatus::parse("archived").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BackupStatus::Pending.is_terminal());
        assert!(!BackupStatus::InProgress.is_terminal());
        assert!(BackupStatus::Completed.is_terminal());
        assert!(BackupStatus::Failed.is_terminal());
        assert!(BackupStatus::Corrupted.is_terminal());
    }

    #[test]
    fn test_create_options_defaults() {
        let opts = CreateBackupOptions::default();
        assert!(opts.compress());
        assert!(opts.verify());
        assert_eq!(opts.source(), TRIGGER_MANUAL);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(BackupError::Validation("x".into()).category(), "validation");
        assert_eq!(BackupError::NotFound("x".into()).category(), "not_found");
        assert_eq!(BackupError::Conflict("x".into()).category(), "conflict");
        assert_eq!(BackupError::Integrity("x".into()).category(), "integrity");
        assert_eq!(BackupError::engine("boom").category(), "engine");
    }

    #[test]
    fn test_new_pending_metadata() {
        let meta = BackupMetadata::new_pending(
            BackupType::Full,
            "nightly".to_string(),
            None,
            None,
            true,
            TRIGGER_MANUAL.to_string(),
        );
        assert_eq!(meta.status, BackupStatus::Pending);
        assert!(meta.compressed);
        assert!(meta.checksum.is_none());
        assert!(meta.completed_at.is_none());
    }
}
