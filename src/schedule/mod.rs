pub mod scheduler;

pub use scheduler::*;

use crate::backup::{BackupError, BackupType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// One recurring backup definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Five-field cron expression (minute hour day month weekday).
    pub cron_expression: String,
    pub backup_type: BackupType,
    pub enabled: bool,
    pub retention_days: u32,
    pub compression_enabled: bool,
    pub verification_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub compression_enabled: Option<bool>,
    #[serde(default)]
    pub verification_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub backup_type: Option<BackupType>,
    pub enabled: Option<bool>,
    pub retention_days: Option<u32>,
    pub compression_enabled: Option<bool>,
    pub verification_enabled: Option<bool>,
}

/// Validate a five-field cron expression and return it in the
/// seconds-leading form the job scheduler expects.
pub fn validate_cron_expression(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(BackupError::Validation(format!(
            "cron expression '{expr}' must have five fields (minute hour day month weekday)"
        )));
    }
    let normalized = format!("0 {}", fields.join(" "));
    tokio_cron_scheduler::Job::new_async(normalized.as_str(), |_id, _scheduler| {
        Box::pin(async {})
    })
    .map_err(|e| BackupError::Validation(format!("invalid cron expression '{expr}': {e}")))?;
    Ok(normalized)
}

/// SQLite catalog for schedule definitions.
#[derive(Debug)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        debug!("Initializing schedule catalog");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                cron_expression TEXT NOT NULL,
                backup_type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                retention_days INTEGER NOT NULL DEFAULT 30,
                compression_enabled INTEGER NOT NULL DEFAULT 1,
                verification_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create(&self, new: NewSchedule) -> Result<ScheduleConfig> {
        if new.name.trim().is_empty() {
            return Err(BackupError::Validation(
                "schedule name must not be empty".to_string(),
            ));
        }
        validate_cron_expression(&new.cron_expression)?;
        if self.get_by_name(&new.name).await?.is_some() {
            return Err(BackupError::Conflict(format!(
                "a schedule named '{}' already exists",
                new.name
            )));
        }

        let now = Utc::now();
        let schedule = ScheduleConfig {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            cron_expression: new.cron_expression,
            backup_type: new.backup_type,
            enabled: new.enabled.unwrap_or(true),
            retention_days: new.retention_days.unwrap_or(30),
            compression_enabled: new.compression_enabled.unwrap_or(true),
            verification_enabled: new.verification_enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO backup_schedules (
                id, name, description, cron_expression, backup_type, enabled,
                retention_days, compression_enabled, verification_enabled,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(&schedule.cron_expression)
        .bind(schedule.backup_type.as_str())
        .bind(schedule.enabled)
        .bind(schedule.retention_days as i64)
        .bind(schedule.compression_enabled)
        .bind(schedule.verification_enabled)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(schedule)
    }

    pub async fn list(&self) -> Result<Vec<ScheduleConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM backup_schedules ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduleConfig>> {
        let row = sqlx::query("SELECT * FROM backup_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleConfig>> {
        let row = sqlx::query("SELECT * FROM backup_schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    pub async fn update(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        let mut schedule = self
            .get(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("schedule {id} not found")))?;

        if let Some(name) = update.name {
            if name != schedule.name {
                if self.get_by_name(&name).await?.is_some() {
                    return Err(BackupError::Conflict(format!(
                        "a schedule named '{name}' already exists"
                    )));
                }
                schedule.name = name;
            }
        }
        if let Some(description) = update.description {
            schedule.description = Some(description);
        }
        if let Some(cron_expression) = update.cron_expression {
            validate_cron_expression(&cron_expression)?;
            schedule.cron_expression = cron_expression;
        }
        if let Some(backup_type) = update.backup_type {
            schedule.backup_type = backup_type;
        }
        if let Some(enabled) = update.enabled {
            schedule.enabled = enabled;
        }
        if let Some(retention_days) = update.retention_days {
            schedule.retention_days = retention_days;
        }
        if let Some(compression_enabled) = update.compression_enabled {
            schedule.compression_enabled = compression_enabled;
        }
        if let Some(verification_enabled) = update.verification_enabled {
            schedule.verification_enabled = verification_enabled;
        }
        schedule.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE backup_schedules SET
                name = $2, description = $3, cron_expression = $4, backup_type = $5,
                enabled = $6, retention_days = $7, compression_enabled = $8,
                verification_enabled = $9, updated_at = $10
            WHERE id = $1
        "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(&schedule.cron_expression)
        .bind(schedule.backup_type.as_str())
        .bind(schedule.enabled)
        .bind(schedule.retention_days as i64)
        .bind(schedule.compression_enabled)
        .bind(schedule.verification_enabled)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM backup_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("schedule {id} not found")));
        }
        Ok(())
    }
}

fn row_to_schedule(row: &SqliteRow) -> Result<ScheduleConfig> {
    Ok(ScheduleConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        cron_expression: row.try_get("cron_expression")?,
        backup_type: BackupType::parse(&row.try_get::<String, _>("backup_type")?)?,
        enabled: row.try_get("enabled")?,
        retention_days: row.try_get::<i64, _>("retention_days")? as u32,
        compression_enabled: row.try_get("compression_enabled")?,
        verification_enabled: row.try_get("verification_enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> ScheduleStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ScheduleStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    fn nightly() -> NewSchedule {
        NewSchedule {
            name: "nightly".to_string(),
            description: None,
            cron_expression: "0 2 * * *".to_string(),
            backup_type: BackupType::Full,
            enabled: None,
            retention_days: None,
            compression_enabled: None,
            verification_enabled: None,
        }
    }

    #[test]
    fn test_cron_validation() {
        assert!(validate_cron_expression("0 2 * * *").is_ok());
        assert!(validate_cron_expression("*/15 * * * *").is_ok());
        assert_eq!(
            validate_cron_expression("0 2 * * *").unwrap(),
            "0 0 2 * * *"
        );
        assert!(validate_cron_expression("0 2 * *").is_err());
        assert!(validate_cron_expression("not a cron at all").is_err());
        assert!(validate_cron_expression("99 99 * * *").is_err());
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let store = memory_store().await;
        let schedule = store.create(nightly()).await.unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.retention_days, 30);
        assert!(schedule.compression_enabled);
        assert!(schedule.verification_enabled);

        let loaded = store.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "nightly");
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = memory_store().await;
        store.create(nightly()).await.unwrap();
        let err = store.create(nightly()).await.unwrap_err();
        assert!(matches!(err, BackupError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_cron_is_validation_error() {
        let store = memory_store().await;
        let mut bad = nightly();
        bad.cron_expression = "whenever".to_string();
        let err = store.create(bad).await.unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = memory_store().await;
        let schedule = store.create(nightly()).await.unwrap();

        let updated = store
            .update(
                &schedule.id,
                ScheduleUpdate {
                    enabled: Some(false),
                    retention_days: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.retention_days, 7);

        store.delete(&schedule.id).await.unwrap();
        let err = store.delete(&schedule.id).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }
}
