pub mod api;
pub mod backup;
pub mod config;
pub mod schedule;

pub use config::Settings;

// Re-export backup types for convenience
pub use backup::{
    open_pool, BackupError, BackupListFilter, BackupMetadata, BackupService, BackupStatistics,
    BackupStatus, BackupStore, BackupType, CreateBackupOptions, IntegrityReport, IntegrityVerifier,
    PartialRestoreOptions, ProgressTracker, RestoreEngine, RestoreOptions, RestoreProgress,
    RestoreSummary, SnapshotEngine, SqliteBackupStore,
};

// Re-export schedule types
pub use schedule::{
    BackupScheduler, CascadePolicy, NewSchedule, ScheduleConfig, ScheduleStore, ScheduleUpdate,
    SchedulerSettings,
};
