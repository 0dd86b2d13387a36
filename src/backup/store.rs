use super::{BackupMetadata, BackupStatus, BackupType, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Hard ceiling on page sizes returned by `list`.
pub const MAX_LIST_LIMIT: u32 = 100;

/// Open the shared SQLite pool used by the live store and the catalogs.
///
/// Foreign keys are intentionally left unenforced at the connection level;
/// the domain services own their referential integrity and the verifier
/// checks it explicitly with `PRAGMA foreign_key_check`.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(false)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

#[derive(Debug, Clone, Default)]
pub struct BackupListFilter {
    pub backup_type: Option<BackupType>,
    pub status: Option<BackupStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Catalog abstraction for backup metadata operations.
#[async_trait]
pub trait BackupStore: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<()>;
    async fn insert(&self, metadata: &BackupMetadata) -> Result<()>;
    async fn update(&self, metadata: &BackupMetadata) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<BackupMetadata>>;
    async fn list(&self, filter: &BackupListFilter) -> Result<Vec<BackupMetadata>>;
    async fn children_of(&self, id: &str) -> Result<Vec<BackupMetadata>>;
    async fn latest_completed(
        &self,
        backup_type: Option<BackupType>,
    ) -> Result<Option<BackupMetadata>>;
    async fn completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        triggered_by: Option<&str>,
    ) -> Result<Vec<BackupMetadata>>;
    async fn recent(&self, days: u32) -> Result<Vec<BackupMetadata>>;
    async fn count(&self) -> Result<u64>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Ids whose `parent_backup_id` no longer resolves to a catalog row.
    async fn dangling_parent_ids(&self) -> Result<Vec<String>>;
}

/// SQLite implementation of the backup metadata catalog.
#[derive(Debug)]
pub struct SqliteBackupStore {
    pool: SqlitePool,
}

impl SqliteBackupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_metadata(row: &SqliteRow) -> Result<BackupMetadata> {
        let backup_type = BackupType::parse(&row.try_get::<String, _>("backup_type")?)?;
        let status = BackupStatus::parse(&row.try_get::<String, _>("status")?)?;
        let file_path: Option<String> = row.try_get("file_path")?;

        Ok(BackupMetadata {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            backup_type,
            status,
            parent_backup_id: row.try_get("parent_backup_id")?,
            size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
            checksum: row.try_get("checksum")?,
            file_path: file_path.map(PathBuf::from),
            compressed: row.try_get("compressed")?,
            snapshot_seq: row.try_get("snapshot_seq")?,
            delta_start_seq: row.try_get("delta_start_seq")?,
            triggered_by: row.try_get("triggered_by")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, name, description, backup_type, status, parent_backup_id, \
     size_bytes, checksum, file_path, compressed, snapshot_seq, delta_start_seq, \
     triggered_by, error, created_at, completed_at";

#[async_trait]
impl BackupStore for SqliteBackupStore {
    async fn initialize(&self) -> Result<()> {
        debug!("Initializing backup metadata catalog");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_metadata (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                backup_type TEXT NOT NULL,
                status TEXT NOT NULL,
                parent_backup_id TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                checksum TEXT,
                file_path TEXT,
                compressed INTEGER NOT NULL DEFAULT 1,
                snapshot_seq INTEGER,
                delta_start_seq INTEGER,
                triggered_by TEXT NOT NULL DEFAULT 'manual',
                error TEXT,
                created_at TIMESTAMP NOT NULL,
                completed_at TIMESTAMP
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_metadata_created
             ON backup_metadata (created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_metadata_parent
             ON backup_metadata (parent_backup_id)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Backup metadata catalog initialized");
        Ok(())
    }

    async fn insert(&self, metadata: &BackupMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_metadata (
                id, name, description, backup_type, status, parent_backup_id,
                size_bytes, checksum, file_path, compressed, snapshot_seq,
                delta_start_seq, triggered_by, error, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
        )
        .bind(&metadata.id)
        .bind(&metadata.name)
        .bind(&metadata.description)
        .bind(metadata.backup_type.as_str())
        .bind(metadata.status.as_str())
        .bind(&metadata.parent_backup_id)
        .bind(metadata.size_bytes as i64)
        .bind(&metadata.checksum)
        .bind(
            metadata
                .file_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(metadata.compressed)
        .bind(metadata.snapshot_seq)
        .bind(metadata.delta_start_seq)
        .bind(&metadata.triggered_by)
        .bind(&metadata.error)
        .bind(metadata.created_at)
        .bind(metadata.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, metadata: &BackupMetadata) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backup_metadata SET
                status = $2, size_bytes = $3, checksum = $4, file_path = $5,
                snapshot_seq = $6, delta_start_seq = $7, error = $8, completed_at = $9
            WHERE id = $1
        "#,
        )
        .bind(&metadata.id)
        .bind(metadata.status.as_str())
        .bind(metadata.size_bytes as i64)
        .bind(&metadata.checksum)
        .bind(
            metadata
                .file_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(metadata.snapshot_seq)
        .bind(metadata.delta_start_seq)
        .bind(&metadata.error)
        .bind(metadata.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_metadata).transpose()
    }

    async fn list(&self, filter: &BackupListFilter) -> Result<Vec<BackupMetadata>> {
        let limit = filter.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0);

        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata WHERE 1 = 1"
        ));
        if let Some(backup_type) = filter.backup_type {
            builder.push(" AND backup_type = ");
            builder.push_bind(backup_type.as_str());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_metadata).collect()
    }

    async fn children_of(&self, id: &str) -> Result<Vec<BackupMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata
             WHERE parent_backup_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_metadata).collect()
    }

    async fn latest_completed(
        &self,
        backup_type: Option<BackupType>,
    ) -> Result<Option<BackupMetadata>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata WHERE status = 'completed'"
        ));
        if let Some(backup_type) = backup_type {
            builder.push(" AND backup_type = ");
            builder.push_bind(backup_type.as_str());
        }
        builder.push(" ORDER BY created_at DESC LIMIT 1");

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_metadata).transpose()
    }

    async fn completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
        triggered_by: Option<&str>,
    ) -> Result<Vec<BackupMetadata>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata
             WHERE status = 'completed' AND created_at < "
        ));
        builder.push_bind(cutoff);
        if let Some(source) = triggered_by {
            builder.push(" AND triggered_by = ");
            builder.push_bind(source.to_string());
        }
        builder.push(" ORDER BY created_at ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_metadata).collect()
    }

    async fn recent(&self, days: u32) -> Result<Vec<BackupMetadata>> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM backup_metadata
             WHERE created_at > $1
             ORDER BY created_at DESC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_metadata).collect()
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM backup_metadata WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dangling_parent_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM backup_metadata
             WHERE parent_backup_id IS NOT NULL
             AND parent_backup_id NOT IN (SELECT id FROM backup_metadata)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::TRIGGER_MANUAL;

    async fn memory_store() -> SqliteBackupStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteBackupStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    fn sample(backup_type: BackupType, parent: Option<&str>) -> BackupMetadata {
        BackupMetadata::new_pending(
            backup_type,
            "sample".to_string(),
            None,
            parent.map(str::to_string),
            true,
            TRIGGER_MANUAL.to_string(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = memory_store().await;
        let mut meta = sample(BackupType::Full, None);
        meta.checksum = Some("abc123".to_string());
        store.insert(&meta).await.unwrap();

        let loaded = store.get(&meta.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, meta.id);
        assert_eq!(loaded.backup_type, BackupType::Full);
        assert_eq!(loaded.status, BackupStatus::Pending);
        assert_eq!(loaded.checksum.as_deref(), Some("abc123"));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_update_persists() {
        let store = memory_store().await;
        let mut meta = sample(BackupType::Full, None);
        store.insert(&meta).await.unwrap();

        meta.status = BackupStatus::Completed;
        meta.size_bytes = 4096;
        meta.completed_at = Some(Utc::now());
        store.update(&meta).await.unwrap();

        let loaded = store.get(&meta.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Completed);
        assert_eq!(loaded.size_bytes, 4096);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_cap() {
        let store = memory_store().await;
        for i in 0..3 {
            let mut meta = sample(BackupType::Full, None);
            if i == 0 {
                meta.status = BackupStatus::Completed;
                store.insert(&meta).await.unwrap();
                store.update(&meta).await.unwrap();
            } else {
                store.insert(&meta).await.unwrap();
            }
        }

        let all = store.list(&BackupListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let completed = store
            .list(&BackupListFilter {
                status: Some(BackupStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);

        let capped = store
            .list(&BackupListFilter {
                limit: Some(10_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(capped.len() <= MAX_LIST_LIMIT as usize);
    }

    #[tokio::test]
    async fn test_children_and_dangling_parents() {
        let store = memory_store().await;
        let parent = sample(BackupType::Full, None);
        store.insert(&parent).await.unwrap();
        let child = sample(BackupType::Incremental, Some(&parent.id));
        store.insert(&child).await.unwrap();
        let orphan = sample(BackupType::Incremental, Some("gone"));
        store.insert(&orphan).await.unwrap();

        let children = store.children_of(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);

        let dangling = store.dangling_parent_ids().await.unwrap();
        assert_eq!(dangling, vec![orphan.id]);
    }
}
