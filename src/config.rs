use crate::backup::BackupConfig;
use crate::schedule::{CascadePolicy, SchedulerSettings};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Process-level configuration, loaded from defaults plus `TASKVAULT_*`
/// environment overrides (a local `.env` file is honoured in development).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path of the SQLite database holding the live store and catalogs
    pub database_path: PathBuf,

    /// Directory receiving backup artifacts
    pub artifact_directory: PathBuf,

    /// Port for the HTTP contract surface
    pub http_port: u16,

    /// zstd level for compressed artifacts
    pub compression_level: i32,

    /// Retention window for finished restore progress records
    pub progress_retention_minutes: i64,

    /// Interval of the progress eviction sweep
    pub progress_sweep_seconds: u64,

    /// Whether the scheduler starts with the process
    pub scheduler_enabled: bool,

    /// Scheduled runs longer than this are logged as anomalies
    pub max_scheduled_run_seconds: u64,

    /// Retention policy for aged parents with incremental children
    pub retention_cascade: CascadePolicy,

    /// Tables every full artifact is expected to contain
    pub expected_tables: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("taskvault.db"),
            artifact_directory: PathBuf::from("backups"),
            http_port: 8710,
            compression_level: 3,
            progress_retention_minutes: 30,
            progress_sweep_seconds: 60,
            scheduler_enabled: true,
            max_scheduled_run_seconds: 1800,
            retention_cascade: CascadePolicy::Cascade,
            expected_tables: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = Settings::default();

        if let Ok(path) = env::var("TASKVAULT_DATABASE_PATH") {
            settings.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("TASKVAULT_BACKUP_DIR") {
            settings.artifact_directory = PathBuf::from(dir);
        }
        if let Ok(port) = env::var("TASKVAULT_HTTP_PORT") {
            settings.http_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_HTTP_PORT: {e}"))?;
        }
        if let Ok(level) = env::var("TASKVAULT_COMPRESSION_LEVEL") {
            settings.compression_level = level
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_COMPRESSION_LEVEL: {e}"))?;
        }
        if let Ok(minutes) = env::var("TASKVAULT_PROGRESS_RETENTION_MINUTES") {
            settings.progress_retention_minutes = minutes
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_PROGRESS_RETENTION_MINUTES: {e}"))?;
        }
        if let Ok(seconds) = env::var("TASKVAULT_PROGRESS_SWEEP_SECONDS") {
            settings.progress_sweep_seconds = seconds
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_PROGRESS_SWEEP_SECONDS: {e}"))?;
        }
        if let Ok(enabled) = env::var("TASKVAULT_SCHEDULER_ENABLED") {
            settings.scheduler_enabled = enabled
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_SCHEDULER_ENABLED: {e}"))?;
        }
        if let Ok(seconds) = env::var("TASKVAULT_MAX_SCHEDULED_RUN_SECONDS") {
            settings.max_scheduled_run_seconds = seconds
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_MAX_SCHEDULED_RUN_SECONDS: {e}"))?;
        }
        if let Ok(policy) = env::var("TASKVAULT_RETENTION_CASCADE") {
            settings.retention_cascade = CascadePolicy::parse(&policy)
                .map_err(|e| anyhow::anyhow!("Invalid TASKVAULT_RETENTION_CASCADE: {e}"))?;
        }
        if let Ok(tables) = env::var("TASKVAULT_EXPECTED_TABLES") {
            settings.expected_tables = tables
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }

        Ok(settings)
    }

    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            artifact_directory: self.artifact_directory.clone(),
            compression_level: self.compression_level,
            progress_retention_minutes: self.progress_retention_minutes,
            expected_tables: self.expected_tables.clone(),
            row_count_floors: Default::default(),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_run_seconds: self.max_scheduled_run_seconds,
            cascade_policy: self.retention_cascade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.http_port, 8710);
        assert_eq!(settings.retention_cascade, CascadePolicy::Cascade);
        assert!(settings.scheduler_enabled);
    }

    #[test]
    fn test_backup_config_projection() {
        let mut settings = Settings::default();
        settings.expected_tables = vec!["tasks".to_string(), "boards".to_string()];
        let config = settings.backup_config();
        assert_eq!(config.expected_tables.len(), 2);
        assert_eq!(config.compression_level, 3);
    }
}
