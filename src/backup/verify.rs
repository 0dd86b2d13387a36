use super::snapshot::{compute_file_checksum, decode_artifact};
use super::{BackupConfig, BackupMetadata, BackupStore, BackupType, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// Outcome of verifying one backup artifact against its catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVerification {
    pub backup_id: String,
    pub valid: bool,
    pub checksum_ok: bool,
    pub decode_ok: bool,
    pub manifest_ok: bool,
    pub issues: Vec<String>,
}

impl ArtifactVerification {
    fn failed(backup_id: &str, issues: Vec<String>) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            valid: false,
            checksum_ok: false,
            decode_ok: false,
            manifest_ok: false,
            issues,
        }
    }

    pub fn message(&self) -> String {
        if self.valid {
            "backup verified".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

/// One named check of the live-store integrity report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub is_passed: bool,
    pub checks: Vec<IntegrityCheck>,
}

/// Validates artifact checksums and performs logical sanity checks against
/// both artifacts and the live store.
pub struct IntegrityVerifier {
    pool: SqlitePool,
    config: BackupConfig,
}

impl IntegrityVerifier {
    pub fn new(pool: SqlitePool, config: BackupConfig) -> Self {
        Self { pool, config }
    }

    /// Recompute the artifact checksum, decode it, and validate its manifest
    /// against the catalog record and the configured expected shape.
    pub async fn verify_artifact(&self, metadata: &BackupMetadata) -> Result<ArtifactVerification> {
        debug!(backup_id = %metadata.id, "Verifying backup artifact");

        let path = match metadata.file_path.as_ref() {
            Some(path) => path,
            None => {
                return Ok(ArtifactVerification::failed(
                    &metadata.id,
                    vec!["no artifact file recorded for backup".to_string()],
                ))
            }
        };
        if !path.exists() {
            return Ok(ArtifactVerification::failed(
                &metadata.id,
                vec![format!("artifact file missing: {}", path.display())],
            ));
        }

        let mut result = ArtifactVerification {
            backup_id: metadata.id.clone(),
            valid: false,
            checksum_ok: false,
            decode_ok: false,
            manifest_ok: false,
            issues: Vec::new(),
        };

        let actual = compute_file_checksum(path).await?;
        match metadata.checksum.as_deref() {
            Some(expected) if expected == actual => result.checksum_ok = true,
            Some(expected) => {
                result.issues.push(format!(
                    "checksum mismatch: expected {expected}, computed {actual}"
                ));
                warn!(backup_id = %metadata.id, "Backup checksum mismatch");
                return Ok(result);
            }
            None => {
                result
                    .issues
                    .push("no checksum recorded for backup".to_string());
                return Ok(result);
            }
        }

        let bytes = tokio::fs::read(path).await?;
        let artifact = match decode_artifact(&bytes, metadata.compressed) {
            Ok(artifact) => {
                result.decode_ok = true;
                artifact
            }
            Err(e) => {
                result.issues.push(format!("artifact is not decodable: {e}"));
                return Ok(result);
            }
        };

        result.manifest_ok = true;
        if artifact.backup_id != metadata.id {
            result.manifest_ok = false;
            result.issues.push(format!(
                "artifact belongs to backup {}, not {}",
                artifact.backup_id, metadata.id
            ));
        }
        if artifact.backup_type != metadata.backup_type {
            result.manifest_ok = false;
            result.issues.push(format!(
                "artifact type {} does not match catalog type {}",
                artifact.backup_type.as_str(),
                metadata.backup_type.as_str()
            ));
        }
        if metadata.backup_type == BackupType::Full {
            for expected in &self.config.expected_tables {
                if !artifact.tables.iter().any(|t| &t.name == expected) {
                    result.manifest_ok = false;
                    result
                        .issues
                        .push(format!("expected table {expected} missing from artifact"));
                }
            }
            for (table, floor) in &self.config.row_count_floors {
                if let Some(snapshot) = artifact.tables.iter().find(|t| &t.name == table) {
                    if (snapshot.rows.len() as u64) < *floor {
                        result.manifest_ok = false;
                        result.issues.push(format!(
                            "table {table} has {} rows, below the floor of {floor}",
                            snapshot.rows.len()
                        ));
                    }
                }
            }
        }

        result.valid = result.checksum_ok && result.decode_ok && result.manifest_ok;
        if result.valid {
            debug!(backup_id = %metadata.id, "Backup artifact verified");
        } else {
            warn!(
                backup_id = %metadata.id,
                issues = ?result.issues,
                "Backup artifact failed verification"
            );
        }
        Ok(result)
    }

    /// Referential-integrity check of the live store, independent of any
    /// backup. Guards against snapshotting or restoring over a store that
    /// is already inconsistent.
    pub async fn check_live_integrity(&self, store: &dyn BackupStore) -> Result<IntegrityReport> {
        info!("Running live store integrity check");
        let mut checks = Vec::new();

        let integrity_rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await?;
        let passed = integrity_rows.len() == 1 && integrity_rows[0] == "ok";
        checks.push(IntegrityCheck {
            name: "database_integrity".to_string(),
            passed,
            message: if passed {
                "ok".to_string()
            } else {
                integrity_rows.join("; ")
            },
        });

        let fk_rows = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&self.pool)
            .await?;
        let passed = fk_rows.is_empty();
        let message = if passed {
            "no foreign key violations".to_string()
        } else {
            let mut tables: Vec<String> = fk_rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>(0).ok())
                .collect();
            tables.sort();
            tables.dedup();
            format!(
                "{} foreign key violation(s) in: {}",
                fk_rows.len(),
                tables.join(", ")
            )
        };
        checks.push(IntegrityCheck {
            name: "foreign_keys".to_string(),
            passed,
            message,
        });

        let dangling = store.dangling_parent_ids().await?;
        checks.push(IntegrityCheck {
            name: "backup_lineage".to_string(),
            passed: dangling.is_empty(),
            message: if dangling.is_empty() {
                "all incremental parents resolve".to_string()
            } else {
                format!("backups with missing parents: {}", dangling.join(", "))
            },
        });

        let completed = store
            .list(&super::BackupListFilter {
                status: Some(super::BackupStatus::Completed),
                ..Default::default()
            })
            .await?;
        let mut missing_files = Vec::new();
        for backup in &completed {
            match backup.file_path.as_ref() {
                Some(path) if path.exists() => {}
                _ => missing_files.push(backup.id.clone()),
            }
        }
        checks.push(IntegrityCheck {
            name: "artifact_files".to_string(),
            passed: missing_files.is_empty(),
            message: if missing_files.is_empty() {
                "all completed backups have artifacts on disk".to_string()
            } else {
                format!("missing artifact files for: {}", missing_files.join(", "))
            },
        });

        let is_passed = checks.iter().all(|c| c.passed);
        if !is_passed {
            warn!(?checks, "Live store integrity check failed");
        }
        Ok(IntegrityReport { is_passed, checks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{
        BackupMetadata, SnapshotEngine, SqliteBackupStore, BackupStore as _, TRIGGER_MANUAL,
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool, SnapshotEngine, IntegrityVerifier) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tasks (id, title) VALUES ('t1', 'only row')")
            .execute(&pool)
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            artifact_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let engine = SnapshotEngine::new(pool.clone(), config.clone());
        engine.initialize().await.unwrap();
        let verifier = IntegrityVerifier::new(pool.clone(), config);
        (dir, pool, engine, verifier)
    }

    async fn completed_full(engine: &SnapshotEngine) -> BackupMetadata {
        let mut meta = BackupMetadata::new_pending(
            BackupType::Full,
            "verify-me".to_string(),
            None,
            None,
            false,
            TRIGGER_MANUAL.to_string(),
        );
        let outcome = engine.snapshot_full(&meta).await.unwrap();
        meta.file_path = Some(outcome.file_path);
        meta.checksum = Some(outcome.checksum);
        meta.snapshot_seq = Some(outcome.snapshot_seq);
        meta
    }

    #[tokio::test]
    async fn test_untouched_artifact_verifies() {
        let (_dir, _pool, engine, verifier) = setup().await;
        let meta = completed_full(&engine).await;
        let result = verifier.verify_artifact(&meta).await.unwrap();
        assert!(result.valid, "issues: {:?}", result.issues);
        assert!(result.checksum_ok && result.decode_ok && result.manifest_ok);
    }

    #[tokio::test]
    async fn test_corrupted_artifact_fails_checksum() {
        let (_dir, _pool, engine, verifier) = setup().await;
        let meta = completed_full(&engine).await;

        let path = meta.file_path.clone().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = verifier.verify_artifact(&meta).await.unwrap();
        assert!(!result.valid);
        assert!(!result.checksum_ok);
        assert!(result.message().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let (_dir, _pool, engine, verifier) = setup().await;
        let meta = completed_full(&engine).await;
        std::fs::remove_file(meta.file_path.as_ref().unwrap()).unwrap();
        let result = verifier.verify_artifact(&meta).await.unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_live_integrity_reports_named_checks() {
        let (_dir, pool, _engine, verifier) = setup().await;
        let store = SqliteBackupStore::new(pool);
        store.initialize().await.unwrap();

        let report = verifier.check_live_integrity(&store).await.unwrap();
        assert!(report.is_passed);
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"database_integrity"));
        assert!(names.contains(&"foreign_keys"));
        assert!(names.contains(&"backup_lineage"));
        assert!(names.contains(&"artifact_files"));
    }
}
