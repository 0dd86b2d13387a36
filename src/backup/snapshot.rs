use super::{BackupConfig, BackupError, BackupMetadata, BackupType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqliteConnection, SqlitePool, TypeInfo, ValueRef};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Internal table receiving one row per mutation of a tracked table.
pub const CHANGE_LOG_TABLE: &str = "backup_change_log";

/// Catalog tables owned by this subsystem; never snapshotted.
const INTERNAL_TABLES: &[&str] = &["backup_metadata", "backup_schedules", CHANGE_LOG_TABLE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(ChangeOp::Insert),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            other => Err(BackupError::engine(format!(
                "unknown change operation in log: {other}"
            ))),
        }
    }
}

/// One captured mutation, replayable in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub table: String,
    pub op: ChangeOp,
    pub pk: Value,
    pub row: Option<Value>,
    pub changed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub create_sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

/// On-disk backup payload. Full snapshots carry `tables`; incremental
/// snapshots carry `changes` covering `(delta_start_seq, snapshot_seq]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotArtifact {
    pub format_version: u32,
    pub backup_id: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub snapshot_seq: i64,
    pub delta_start_seq: Option<i64>,
    #[serde(default)]
    pub tables: Vec<TableSnapshot>,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub snapshot_seq: i64,
    pub delta_start_seq: Option<i64>,
    pub rows_captured: u64,
    pub changes_captured: u64,
}

/// Takes consistent copies of the live store and writes them as artifacts.
pub struct SnapshotEngine {
    pool: SqlitePool,
    config: BackupConfig,
}

impl SnapshotEngine {
    pub fn new(pool: SqlitePool, config: BackupConfig) -> Self {
        Self { pool, config }
    }

    /// Create the change log and install capture triggers on every tracked
    /// table. Idempotent; safe to run at every process start.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing snapshot engine");

        fs::create_dir_all(&self.config.artifact_directory).await?;

        let mut conn = self.pool.acquire().await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {CHANGE_LOG_TABLE} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                op TEXT NOT NULL,
                pk TEXT NOT NULL,
                row_data TEXT,
                changed_at TEXT NOT NULL
            )
        "#
        ))
        .execute(&mut *conn)
        .await?;

        let tables = tracked_tables(&mut *conn).await?;
        for table in &tables {
            ensure_capture_triggers(&mut *conn, table).await?;
        }

        debug!(tables = tables.len(), "Snapshot engine initialized");
        Ok(())
    }

    /// Copy the entire tracked store into a new artifact. All reads happen
    /// inside a single transaction so the snapshot is point-in-time
    /// consistent with the recorded change-log position.
    pub async fn snapshot_full(&self, metadata: &BackupMetadata) -> Result<SnapshotOutcome> {
        debug!(backup_id = %metadata.id, "Taking full snapshot");

        let mut tx = self.pool.begin().await?;
        let tables = tracked_tables(&mut *tx).await?;
        for table in &tables {
            ensure_capture_triggers(&mut *tx, table).await?;
        }
        let snapshot_seq = current_change_seq(&mut *tx).await?;

        let mut table_snapshots = Vec::with_capacity(tables.len());
        let mut rows_captured = 0u64;
        for table in &tables {
            let create_sql: Option<String> =
                sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = $1")
                    .bind(table)
                    .fetch_optional(&mut *tx)
                    .await?;
            let create_sql = create_sql.ok_or_else(|| {
                BackupError::engine(format!("no schema found for tracked table {table}"))
            })?;

            let columns = table_columns(&mut *tx, table)
                .await?
                .into_iter()
                .map(|c| c.name)
                .collect::<Vec<_>>();

            let rows = sqlx::query(&format!("SELECT * FROM {}", quote_ident(table)))
                .fetch_all(&mut *tx)
                .await?;
            rows_captured += rows.len() as u64;
            let rows = rows
                .iter()
                .map(row_to_json)
                .collect::<Result<Vec<Value>>>()?;

            table_snapshots.push(TableSnapshot {
                name: table.clone(),
                create_sql,
                columns,
                rows,
            });
        }
        tx.commit().await?;

        let artifact = SnapshotArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            backup_id: metadata.id.clone(),
            backup_type: BackupType::Full,
            created_at: metadata.created_at,
            snapshot_seq,
            delta_start_seq: None,
            tables: table_snapshots,
            changes: Vec::new(),
        };

        let mut outcome = self.write_artifact(metadata, &artifact).await?;
        outcome.rows_captured = rows_captured;

        info!(
            backup_id = %metadata.id,
            rows = rows_captured,
            bytes = outcome.size_bytes,
            "Full snapshot written"
        );
        Ok(outcome)
    }

    /// Capture the delta since the parent backup's snapshot position.
    pub async fn snapshot_incremental(
        &self,
        metadata: &BackupMetadata,
        parent: &BackupMetadata,
    ) -> Result<SnapshotOutcome> {
        let delta_start = parent.snapshot_seq.ok_or_else(|| {
            BackupError::engine(format!(
                "parent backup {} has no recorded snapshot position",
                parent.id
            ))
        })?;

        debug!(
            backup_id = %metadata.id,
            parent_id = %parent.id,
            delta_start,
            "Taking incremental snapshot"
        );

        let mut tx = self.pool.begin().await?;
        let tables = tracked_tables(&mut *tx).await?;
        for table in &tables {
            ensure_capture_triggers(&mut *tx, table).await?;
        }
        let snapshot_seq = current_change_seq(&mut *tx).await?;

        let rows = sqlx::query(&format!(
            "SELECT seq, table_name, op, pk, row_data, changed_at
             FROM {CHANGE_LOG_TABLE}
             WHERE seq > $1 AND seq <= $2
             ORDER BY seq ASC"
        ))
        .bind(delta_start)
        .bind(snapshot_seq)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let op = ChangeOp::parse(&row.try_get::<String, _>("op")?)?;
            let pk: Value = serde_json::from_str(&row.try_get::<String, _>("pk")?)?;
            let row_data: Option<String> = row.try_get("row_data")?;
            let row_data = row_data.map(|s| serde_json::from_str(&s)).transpose()?;
            changes.push(ChangeRecord {
                seq: row.try_get("seq")?,
                table: row.try_get("table_name")?,
                op,
                pk,
                row: row_data,
                changed_at: row.try_get("changed_at")?,
            });
        }

        let changes_captured = changes.len() as u64;
        let artifact = SnapshotArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            backup_id: metadata.id.clone(),
            backup_type: BackupType::Incremental,
            created_at: metadata.created_at,
            snapshot_seq,
            delta_start_seq: Some(delta_start),
            tables: Vec::new(),
            changes,
        };

        let mut outcome = self.write_artifact(metadata, &artifact).await?;
        outcome.changes_captured = changes_captured;

        info!(
            backup_id = %metadata.id,
            changes = changes_captured,
            bytes = outcome.size_bytes,
            "Incremental snapshot written"
        );
        Ok(outcome)
    }

    /// Load and decode an artifact from disk.
    pub async fn read_artifact(&self, metadata: &BackupMetadata) -> Result<SnapshotArtifact> {
        let path = metadata.file_path.as_ref().ok_or_else(|| {
            BackupError::engine(format!("backup {} has no artifact file recorded", metadata.id))
        })?;
        let bytes = fs::read(path).await.map_err(|e| {
            BackupError::engine(format!(
                "cannot read artifact for backup {}: {e}",
                metadata.id
            ))
        })?;
        decode_artifact(&bytes, metadata.compressed)
    }

    async fn write_artifact(
        &self,
        metadata: &BackupMetadata,
        artifact: &SnapshotArtifact,
    ) -> Result<SnapshotOutcome> {
        self.check_artifact_dir_writable().await?;

        let bytes = encode_artifact(artifact, metadata.compressed, self.config.compression_level)?;
        let file_name = artifact_file_name(
            metadata.backup_type,
            metadata.created_at,
            &metadata.id,
            metadata.compressed,
        );
        let path = self.config.artifact_directory.join(file_name);
        fs::write(&path, &bytes).await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let checksum = hex::encode(hasher.finalize());

        Ok(SnapshotOutcome {
            file_path: path,
            size_bytes: bytes.len() as u64,
            checksum,
            snapshot_seq: artifact.snapshot_seq,
            delta_start_seq: artifact.delta_start_seq,
            rows_captured: 0,
            changes_captured: 0,
        })
    }

    /// Probe the artifact directory before a snapshot so out-of-space and
    /// permission failures surface up front rather than mid-write.
    async fn check_artifact_dir_writable(&self) -> Result<()> {
        fs::create_dir_all(&self.config.artifact_directory).await?;
        let probe = self.config.artifact_directory.join(".write_probe");
        match fs::write(&probe, b"probe").await {
            Ok(_) => {
                let _ = fs::remove_file(&probe).await;
                Ok(())
            }
            Err(e) => Err(BackupError::engine(format!(
                "cannot write to artifact directory {}: {e}",
                self.config.artifact_directory.display()
            ))),
        }
    }
}

pub fn artifact_file_name(
    backup_type: BackupType,
    created_at: DateTime<Utc>,
    id: &str,
    compressed: bool,
) -> String {
    format!(
        "{}_backup_{}_{}.json{}",
        backup_type.as_str(),
        created_at.format("%Y%m%d_%H%M%S"),
        id,
        if compressed { ".zst" } else { "" }
    )
}

pub fn encode_artifact(
    artifact: &SnapshotArtifact,
    compressed: bool,
    level: i32,
) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(artifact)?;
    if compressed {
        Ok(zstd::encode_all(bytes.as_slice(), level)?)
    } else {
        Ok(bytes)
    }
}

pub fn decode_artifact(bytes: &[u8], compressed: bool) -> Result<SnapshotArtifact> {
    let raw = if compressed {
        zstd::decode_all(bytes)?
    } else {
        bytes.to_vec()
    };
    Ok(serde_json::from_slice(&raw)?)
}

/// SHA-256 of a file's on-disk bytes, hex encoded.
pub async fn compute_file_checksum(path: &Path) -> Result<String> {
    let contents = fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn is_internal_table(name: &str) -> bool {
    name.starts_with("sqlite_") || INTERNAL_TABLES.contains(&name)
}

/// Domain tables subject to snapshot and change capture.
pub async fn tracked_tables(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(names.into_iter().filter(|n| !is_internal_table(n)).collect())
}

#[derive(Debug, Clone)]
pub struct TableColumn {
    pub name: String,
    pub pk_rank: i64,
}

pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<TableColumn>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(TableColumn {
                name: row.try_get("name")?,
                pk_rank: row.try_get("pk")?,
            })
        })
        .collect()
}

pub async fn current_change_seq(conn: &mut SqliteConnection) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar(&format!("SELECT COALESCE(MAX(seq), 0) FROM {CHANGE_LOG_TABLE}"))
        .fetch_one(&mut *conn)
        .await?;
    Ok(seq)
}

/// Install the insert/update/delete capture triggers for one table.
/// Triggers are rebuilt from the current column set, so this must be
/// re-run after any DDL that recreates the table.
pub async fn ensure_capture_triggers(conn: &mut SqliteConnection, table: &str) -> Result<()> {
    let columns = table_columns(conn, table).await?;
    if columns.is_empty() {
        return Err(BackupError::engine(format!(
            "cannot install capture triggers: table {table} has no columns"
        )));
    }

    for (op, source) in [("insert", "NEW"), ("update", "NEW"), ("delete", "OLD")] {
        let sql = capture_trigger_sql(table, &columns, op, source);
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

fn capture_trigger_sql(table: &str, columns: &[TableColumn], op: &str, source: &str) -> String {
    let mut pk_cols: Vec<&TableColumn> = columns.iter().filter(|c| c.pk_rank > 0).collect();
    pk_cols.sort_by_key(|c| c.pk_rank);

    let pk_expr = if pk_cols.is_empty() {
        format!("json_object('rowid', {source}.rowid)")
    } else {
        let pairs = pk_cols
            .iter()
            .map(|c| format!("{}, {}.{}", quote_sql_str(&c.name), source, quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("json_object({pairs})")
    };

    let row_expr = if op == "delete" {
        "NULL".to_string()
    } else {
        let mut pairs = columns
            .iter()
            .map(|c| format!("{}, {}.{}", quote_sql_str(&c.name), source, quote_ident(&c.name)))
            .collect::<Vec<_>>();
        if pk_cols.is_empty() {
            pairs.insert(0, format!("'rowid', {source}.rowid"));
        }
        format!("json_object({})", pairs.join(", "))
    };

    let trigger_name = quote_ident(&format!("tv_capture_{table}_{op}"));
    let event = op.to_uppercase();
    format!(
        "CREATE TRIGGER IF NOT EXISTS {trigger_name} AFTER {event} ON {} BEGIN \
         INSERT INTO {CHANGE_LOG_TABLE} (table_name, op, pk, row_data, changed_at) \
         VALUES ({}, '{op}', {pk_expr}, {row_expr}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')); \
         END",
        quote_ident(table),
        quote_sql_str(table),
    )
}

/// Convert one result row to a JSON object keyed by column name. Values
/// keep their SQLite storage class; blobs are wrapped as `{"$blob": hex}`.
pub fn row_to_json(row: &SqliteRow) -> Result<Value> {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_uppercase();
            if type_name.contains("INT") || type_name == "BOOLEAN" {
                Value::from(row.try_get::<i64, _>(idx)?)
            } else if type_name == "REAL" || type_name == "NUMERIC" || type_name.contains("DOUB") {
                Value::from(row.try_get::<f64, _>(idx)?)
            } else if type_name == "BLOB" {
                serde_json::json!({ "$blob": hex::encode(row.try_get::<Vec<u8>, _>(idx)?) })
            } else {
                Value::from(row.try_get::<String, _>(idx)?)
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::TRIGGER_MANUAL;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn engine_with_dir(pool: SqlitePool, dir: &TempDir) -> SnapshotEngine {
        let config = BackupConfig {
            artifact_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        SnapshotEngine::new(pool, config)
    }

    async fn seed_tasks(pool: &SqlitePool) {
        sqlx::query(
            "CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT NOT NULL, done INTEGER NOT NULL DEFAULT 0)",
        )
        .execute(pool)
        .await
        .unwrap();
        for (id, title) in [("t1", "write spec"), ("t2", "review spec")] {
            sqlx::query("INSERT INTO tasks (id, title) VALUES ($1, $2)")
                .bind(id)
                .bind(title)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("tasks"), "\"tasks\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_internal_tables_excluded() {
        assert!(is_internal_table("backup_metadata"));
        assert!(is_internal_table("backup_change_log"));
        assert!(is_internal_table("sqlite_sequence"));
        assert!(!is_internal_table("tasks"));
    }

    #[test]
    fn test_artifact_encode_decode_round_trip() {
        let artifact = SnapshotArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            backup_id: "b1".to_string(),
            backup_type: BackupType::Full,
            created_at: Utc::now(),
            snapshot_seq: 42,
            delta_start_seq: None,
            tables: vec![TableSnapshot {
                name: "tasks".to_string(),
                create_sql: "CREATE TABLE tasks (id TEXT PRIMARY KEY)".to_string(),
                columns: vec!["id".to_string()],
                rows: vec![serde_json::json!({"id": "t1"})],
            }],
            changes: Vec::new(),
        };

        for compressed in [false, true] {
            let bytes = encode_artifact(&artifact, compressed, 3).unwrap();
            let decoded = decode_artifact(&bytes, compressed).unwrap();
            assert_eq!(decoded.backup_id, "b1");
            assert_eq!(decoded.snapshot_seq, 42);
            assert_eq!(decoded.tables.len(), 1);
            assert_eq!(decoded.tables[0].rows.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_capture_triggers_record_mutations() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let engine = engine_with_dir(pool.clone(), &dir);
        seed_tasks(&pool).await;
        engine.initialize().await.unwrap();

        sqlx::query("INSERT INTO tasks (id, title) VALUES ('t3', 'ship it')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE tasks SET done = 1 WHERE id = 't1'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM tasks WHERE id = 't2'")
            .execute(&pool)
            .await
            .unwrap();

        let ops: Vec<(String, String)> =
            sqlx::query_as("SELECT op, pk FROM backup_change_log ORDER BY seq")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].0, "insert");
        assert_eq!(ops[1].0, "update");
        assert_eq!(ops[2].0, "delete");
        assert!(ops[2].1.contains("t2"));
    }

    #[tokio::test]
    async fn test_full_snapshot_captures_rows_and_seq() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let engine = engine_with_dir(pool.clone(), &dir);
        seed_tasks(&pool).await;
        engine.initialize().await.unwrap();

        sqlx::query("INSERT INTO tasks (id, title) VALUES ('t3', 'captured')")
            .execute(&pool)
            .await
            .unwrap();

        let meta = BackupMetadata::new_pending(
            BackupType::Full,
            "snap".to_string(),
            None,
            None,
            false,
            TRIGGER_MANUAL.to_string(),
        );
        let outcome = engine.snapshot_full(&meta).await.unwrap();
        assert_eq!(outcome.rows_captured, 3);
        assert_eq!(outcome.snapshot_seq, 1);
        assert!(outcome.file_path.exists());

        let mut loaded = meta.clone();
        loaded.file_path = Some(outcome.file_path.clone());
        let artifact = engine.read_artifact(&loaded).await.unwrap();
        assert_eq!(artifact.tables.len(), 1);
        assert_eq!(artifact.tables[0].name, "tasks");
        assert_eq!(artifact.tables[0].rows.len(), 3);
    }

    #[tokio::test]
    async fn test_incremental_snapshot_captures_delta_only() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let engine = engine_with_dir(pool.clone(), &dir);
        seed_tasks(&pool).await;
        engine.initialize().await.unwrap();

        let mut parent = BackupMetadata::new_pending(
            BackupType::Full,
            "parent".to_string(),
            None,
            None,
            false,
            TRIGGER_MANUAL.to_string(),
        );
        let outcome = engine.snapshot_full(&parent).await.unwrap();
        parent.snapshot_seq = Some(outcome.snapshot_seq);

        sqlx::query("INSERT INTO tasks (id, title) VALUES ('t9', 'later')")
            .execute(&pool)
            .await
            .unwrap();

        let child = BackupMetadata::new_pending(
            BackupType::Incremental,
            "child".to_string(),
            None,
            Some(parent.id.clone()),
            false,
            TRIGGER_MANUAL.to_string(),
        );
        let outcome = engine.snapshot_incremental(&child, &parent).await.unwrap();
        assert_eq!(outcome.changes_captured, 1);

        let mut loaded = child.clone();
        loaded.file_path = Some(outcome.file_path.clone());
        let artifact = engine.read_artifact(&loaded).await.unwrap();
        assert_eq!(artifact.changes.len(), 1);
        assert_eq!(artifact.changes[0].table, "tasks");
        assert_eq!(artifact.changes[0].op, ChangeOp::Insert);
    }
}
