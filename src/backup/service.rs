use super::export::{render_export, ExportFormat, ExportPayload};
use super::progress::{ProgressTracker, RestoreProgress, RestoreState};
use super::restore::{
    resolve_chain, resolve_point_in_time, resolve_point_in_time_auto, RestorePlan, RestoreEngine,
};
use super::snapshot::{SnapshotArtifact, SnapshotEngine, SnapshotOutcome};
use super::verify::{IntegrityReport, IntegrityVerifier};
use super::{
    BackupConfig, BackupError, BackupListFilter, BackupMetadata, BackupStatus, BackupStore,
    BackupType, CreateBackupOptions, PartialRestoreOptions, RestoreOptions, RestoreSummary,
    Result, TRIGGER_MANUAL,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub valid: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatistics {
    pub total_backups: u64,
    pub successful_backups_last_7_days: u32,
    pub failed_backups_last_7_days: u32,
    pub total_backup_size_bytes: u64,
    pub latest_backup_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCheck {
    pub table: String,
    pub in_backup: bool,
    pub in_live: bool,
    pub backup_rows: u64,
    pub live_rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreValidationReport {
    pub is_valid: bool,
    pub table_checks: Vec<TableCheck>,
    pub errors: Vec<String>,
}

/// Orchestrator for all backup and restore operations.
///
/// Every mutating operation (create, restore, delete, cleanup) serializes on
/// one advisory lock so that at most one of them touches the store at a
/// time. Reads never take the lock. The `preserveExisting` pre-restore
/// backup runs through the internal lock-free create path while the
/// enclosing guard is held; it completes before the restore proper begins.
pub struct BackupService {
    pool: SqlitePool,
    store: Arc<dyn BackupStore>,
    snapshots: SnapshotEngine,
    verifier: IntegrityVerifier,
    restorer: RestoreEngine,
    progress: Arc<ProgressTracker>,
    op_lock: Mutex<()>,
}

impl BackupService {
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn BackupStore>,
        progress: Arc<ProgressTracker>,
        config: BackupConfig,
    ) -> Self {
        let snapshots = SnapshotEngine::new(pool.clone(), config.clone());
        let verifier = IntegrityVerifier::new(pool.clone(), config);
        let restorer = RestoreEngine::new(pool.clone());
        Self {
            pool,
            store,
            snapshots,
            verifier,
            restorer,
            progress,
            op_lock: Mutex::new(()),
        }
    }

    /// Prepare the catalog, change log, and capture triggers.
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        self.snapshots.initialize().await?;
        Ok(())
    }

    // ---- create ------------------------------------------------------

    pub async fn create_full_backup(&self, options: CreateBackupOptions) -> Result<BackupMetadata> {
        let metadata = BackupMetadata::new_pending(
            BackupType::Full,
            options
                .name
                .clone()
                .unwrap_or_else(|| default_backup_name("full")),
            options.description.clone(),
            None,
            options.compress(),
            options.source(),
        );
        self.store.insert(&metadata).await?;

        let _guard = self.op_lock.lock().await;
        self.run_full_snapshot(metadata, options.verify()).await
    }

    pub async fn create_incremental_backup(
        &self,
        options: CreateBackupOptions,
    ) -> Result<BackupMetadata> {
        let parent_id = options.parent_backup_id.clone().ok_or_else(|| {
            BackupError::Validation(
                "parentBackupId is required for incremental backups".to_string(),
            )
        })?;
        // Validate the parent before creating any catalog row.
        self.checked_parent(&parent_id).await?;

        let metadata = BackupMetadata::new_pending(
            BackupType::Incremental,
            options
                .name
                .clone()
                .unwrap_or_else(|| default_backup_name("incremental")),
            options.description.clone(),
            Some(parent_id.clone()),
            options.compress(),
            options.source(),
        );
        self.store.insert(&metadata).await?;

        let _guard = self.op_lock.lock().await;
        // The parent may have been deleted while this call queued.
        let parent = match self.checked_parent(&parent_id).await {
            Ok(parent) => parent,
            Err(e) => {
                self.mark_failed(metadata, &e).await;
                return Err(e);
            }
        };
        self.run_incremental_snapshot(metadata, parent, options.verify())
            .await
    }

    /// Lock-free snapshot path; the caller must hold the exclusivity lock.
    async fn run_full_snapshot(
        &self,
        mut metadata: BackupMetadata,
        verify: bool,
    ) -> Result<BackupMetadata> {
        metadata.status = BackupStatus::InProgress;
        self.store.update(&metadata).await?;
        info!(backup_id = %metadata.id, "Starting full backup");

        let result = self.snapshots.snapshot_full(&metadata).await;
        self.finish_snapshot(metadata, result, verify).await
    }

    async fn run_incremental_snapshot(
        &self,
        mut metadata: BackupMetadata,
        parent: BackupMetadata,
        verify: bool,
    ) -> Result<BackupMetadata> {
        metadata.status = BackupStatus::InProgress;
        self.store.update(&metadata).await?;
        info!(backup_id = %metadata.id, parent_id = %parent.id, "Starting incremental backup");

        let result = self.snapshots.snapshot_incremental(&metadata, &parent).await;
        self.finish_snapshot(metadata, result, verify).await
    }

    async fn finish_snapshot(
        &self,
        mut metadata: BackupMetadata,
        result: Result<SnapshotOutcome>,
        verify: bool,
    ) -> Result<BackupMetadata> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.mark_failed(metadata, &e).await;
                return Err(e);
            }
        };

        metadata.file_path = Some(outcome.file_path);
        metadata.size_bytes = outcome.size_bytes;
        metadata.checksum = Some(outcome.checksum);
        metadata.snapshot_seq = Some(outcome.snapshot_seq);
        metadata.delta_start_seq = outcome.delta_start_seq;

        if verify {
            match self.verifier.verify_artifact(&metadata).await {
                Ok(verification) if !verification.valid => {
                    metadata.status = BackupStatus::Corrupted;
                    metadata.error = Some(verification.message());
                    metadata.completed_at = Some(Utc::now());
                    self.store.update(&metadata).await?;
                    error!(
                        backup_id = %metadata.id,
                        "Backup failed post-snapshot verification"
                    );
                    return Err(BackupError::Integrity(format!(
                        "backup {} failed verification: {}",
                        metadata.id,
                        verification.message()
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_failed(metadata, &e).await;
                    return Err(e);
                }
            }
        }

        metadata.status = BackupStatus::Completed;
        metadata.completed_at = Some(Utc::now());
        metadata.error = None;
        self.store.update(&metadata).await?;
        info!(
            backup_id = %metadata.id,
            bytes = metadata.size_bytes,
            "Backup completed"
        );
        Ok(metadata)
    }

    /// Persist the failure before surfacing it, so listings reflect reality
    /// even when the caller's connection is gone.
    async fn mark_failed(&self, mut metadata: BackupMetadata, cause: &BackupError) {
        metadata.status = BackupStatus::Failed;
        metadata.error = Some(cause.to_string());
        metadata.completed_at = Some(Utc::now());
        if let Err(update_err) = self.store.update(&metadata).await {
            error!(
                backup_id = %metadata.id,
                error = %update_err,
                "Failed to persist backup failure status"
            );
        }
        error!(backup_id = %metadata.id, error = %cause, "Backup failed");
    }

    async fn checked_parent(&self, parent_id: &str) -> Result<BackupMetadata> {
        let parent = self.store.get(parent_id).await?.ok_or_else(|| {
            BackupError::Validation(format!("parent backup {parent_id} does not exist"))
        })?;
        if parent.status != BackupStatus::Completed {
            return Err(BackupError::Validation(format!(
                "parent backup {parent_id} is not completed (status {})",
                parent.status.as_str()
            )));
        }
        Ok(parent)
    }

    // ---- read --------------------------------------------------------

    pub async fn get_backup_metadata(&self, id: &str) -> Result<BackupMetadata> {
        self.require_backup(id).await
    }

    pub async fn list_backups(&self, filter: &BackupListFilter) -> Result<Vec<BackupMetadata>> {
        self.store.list(filter).await
    }

    pub async fn latest_completed_backup(&self) -> Result<Option<BackupMetadata>> {
        self.store.latest_completed(None).await
    }

    pub async fn backup_statistics(&self) -> Result<BackupStatistics> {
        let total_backups = self.store.count().await?;
        let recent = self.store.recent(7).await?;
        let successful = recent
            .iter()
            .filter(|b| b.status == BackupStatus::Completed)
            .count() as u32;
        let failed = recent
            .iter()
            .filter(|b| b.status == BackupStatus::Failed)
            .count() as u32;
        let total_size = recent
            .iter()
            .filter(|b| b.status == BackupStatus::Completed)
            .map(|b| b.size_bytes)
            .sum();
        let latest = self.store.latest_completed(None).await?;

        Ok(BackupStatistics {
            total_backups,
            successful_backups_last_7_days: successful,
            failed_backups_last_7_days: failed,
            total_backup_size_bytes: total_size,
            latest_backup_time: latest.map(|b| b.created_at),
        })
    }

    // ---- verification ------------------------------------------------

    /// Recheck a backup artifact. A checksum or manifest failure moves the
    /// backup to `corrupted`; corrupted backups stay listed so operators can
    /// investigate and delete them explicitly.
    pub async fn verify_backup(&self, id: &str) -> Result<VerifyReport> {
        let mut metadata = self.require_backup(id).await?;
        if !matches!(
            metadata.status,
            BackupStatus::Completed | BackupStatus::Corrupted
        ) {
            return Err(BackupError::Validation(format!(
                "backup {id} cannot be verified in status {}",
                metadata.status.as_str()
            )));
        }

        let verification = self.verifier.verify_artifact(&metadata).await?;
        if !verification.valid && metadata.status != BackupStatus::Corrupted {
            metadata.status = BackupStatus::Corrupted;
            metadata.error = Some(verification.message());
            self.store.update(&metadata).await?;
            warn!(backup_id = %id, "Backup marked corrupted after failed verification");
        }

        Ok(VerifyReport {
            valid: verification.valid,
            message: verification.message(),
        })
    }

    pub async fn perform_data_integrity_check(&self) -> Result<IntegrityReport> {
        self.verifier.check_live_integrity(self.store.as_ref()).await
    }

    // ---- restore -----------------------------------------------------

    pub async fn restore_from_backup(
        &self,
        id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreSummary> {
        let metadata = self.require_backup(id).await?;
        ensure_restorable(&metadata)?;

        let _guard = self.op_lock.lock().await;
        let chain = match options.point_in_time {
            Some(target) => {
                resolve_point_in_time(self.store.as_ref(), &metadata, target).await?
            }
            None => resolve_chain(self.store.as_ref(), &metadata).await?,
        };
        let pre_restore_backup_id = if options.preserve_existing() {
            Some(self.pre_restore_backup().await?.id)
        } else {
            None
        };
        let artifacts = self.load_chain_artifacts(&chain, options.verify()).await?;

        let stats = self
            .restorer
            .apply(
                RestorePlan {
                    chain: &chain,
                    artifacts: &artifacts,
                    tables: None,
                    include_schema: false,
                    allow_dangling_references: false,
                    validate_after: false,
                },
                None,
            )
            .await?;

        Ok(build_summary(&chain, stats, pre_restore_backup_id))
    }

    /// Restore the store to `target_time`. When `backup_id` is given the
    /// chain is that backup's ancestry; otherwise the newest chain covering
    /// the target is chosen from the catalog.
    pub async fn restore_to_point_in_time(
        &self,
        backup_id: Option<&str>,
        target_time: DateTime<Utc>,
        options: RestoreOptions,
    ) -> Result<RestoreSummary> {
        if let Some(id) = backup_id {
            let metadata = self.require_backup(id).await?;
            ensure_restorable(&metadata)?;
        }

        let _guard = self.op_lock.lock().await;
        let chain = match backup_id {
            Some(id) => {
                let metadata = self.require_backup(id).await?;
                resolve_point_in_time(self.store.as_ref(), &metadata, target_time).await?
            }
            None => resolve_point_in_time_auto(self.store.as_ref(), target_time).await?,
        };
        let pre_restore_backup_id = if options.preserve_existing() {
            Some(self.pre_restore_backup().await?.id)
        } else {
            None
        };
        let artifacts = self.load_chain_artifacts(&chain, options.verify()).await?;

        let stats = self
            .restorer
            .apply(
                RestorePlan {
                    chain: &chain,
                    artifacts: &artifacts,
                    tables: None,
                    include_schema: false,
                    allow_dangling_references: false,
                    validate_after: false,
                },
                None,
            )
            .await?;

        Ok(build_summary(&chain, stats, pre_restore_backup_id))
    }

    /// Restore only the named tables, leaving everything else untouched.
    pub async fn restore_partial_data(
        &self,
        id: &str,
        options: PartialRestoreOptions,
    ) -> Result<RestoreSummary> {
        if options.tables.is_empty() {
            return Err(BackupError::Validation(
                "tables must not be empty for a partial restore".to_string(),
            ));
        }
        let metadata = self.require_backup(id).await?;
        ensure_restorable(&metadata)?;

        let _guard = self.op_lock.lock().await;
        let chain = match options.point_in_time {
            Some(target) => {
                resolve_point_in_time(self.store.as_ref(), &metadata, target).await?
            }
            None => resolve_chain(self.store.as_ref(), &metadata).await?,
        };
        let pre_restore_backup_id = if options.preserve_existing() {
            Some(self.pre_restore_backup().await?.id)
        } else {
            None
        };
        let artifacts = self.load_chain_artifacts(&chain, options.verify()).await?;

        let stats = self
            .restorer
            .apply(
                RestorePlan {
                    chain: &chain,
                    artifacts: &artifacts,
                    tables: Some(&options.tables),
                    include_schema: options.include_schema(),
                    allow_dangling_references: options.allow_dangling_references(),
                    validate_after: options.validate_after(),
                },
                None,
            )
            .await?;

        Ok(build_summary(&chain, stats, pre_restore_backup_id))
    }

    /// Start a restore as a background task and return its progress id
    /// immediately. The restore runs to completion or failure once started;
    /// clearing the progress record never cancels it.
    pub async fn restore_from_backup_with_progress(
        self: &Arc<Self>,
        id: &str,
        options: RestoreOptions,
    ) -> Result<String> {
        let metadata = self.require_backup(id).await?;
        ensure_restorable(&metadata)?;

        let progress_id = self
            .progress
            .start(4, format!("restore of backup {} queued", metadata.id))
            .await;

        let service = Arc::clone(self);
        let task_progress_id = progress_id.clone();
        let backup_id = metadata.id.clone();
        tokio::spawn(async move {
            if let Err(e) = service
                .run_tracked_restore(&backup_id, options, &task_progress_id)
                .await
            {
                error!(
                    backup_id = %backup_id,
                    progress_id = %task_progress_id,
                    error = %e,
                    "Tracked restore failed"
                );
                service.progress.fail(&task_progress_id, e.to_string()).await;
            }
        });

        Ok(progress_id)
    }

    async fn run_tracked_restore(
        &self,
        id: &str,
        options: RestoreOptions,
        progress_id: &str,
    ) -> Result<()> {
        let metadata = self.require_backup(id).await?;

        let _guard = self.op_lock.lock().await;
        self.progress
            .update(
                progress_id,
                RestoreState::Verifying,
                1,
                4,
                "verifying backup chain",
            )
            .await;

        let chain = match options.point_in_time {
            Some(target) => {
                resolve_point_in_time(self.store.as_ref(), &metadata, target).await?
            }
            None => resolve_chain(self.store.as_ref(), &metadata).await?,
        };
        let pre_restore_backup_id = if options.preserve_existing() {
            Some(self.pre_restore_backup().await?.id)
        } else {
            None
        };
        let artifacts = self.load_chain_artifacts(&chain, options.verify()).await?;

        let stats = self
            .restorer
            .apply(
                RestorePlan {
                    chain: &chain,
                    artifacts: &artifacts,
                    tables: None,
                    include_schema: false,
                    allow_dangling_references: false,
                    validate_after: false,
                },
                Some((self.progress.as_ref(), progress_id)),
            )
            .await?;

        let summary = build_summary(&chain, stats, pre_restore_backup_id);
        self.progress
            .complete(
                progress_id,
                format!(
                    "restored {} table(s), {} row(s) applied, {} change(s) replayed",
                    summary.tables_restored.len(),
                    summary.rows_applied,
                    summary.changes_replayed
                ),
            )
            .await;
        Ok(())
    }

    pub async fn get_restore_progress(&self, progress_id: &str) -> Result<RestoreProgress> {
        self.progress.get(progress_id).await.ok_or_else(|| {
            BackupError::NotFound(format!("restore progress {progress_id} not found"))
        })
    }

    pub async fn clear_restore_progress(&self, progress_id: &str) -> bool {
        self.progress.clear(progress_id).await
    }

    // ---- export / validation ----------------------------------------

    pub async fn export_backup(&self, id: &str, format: &str) -> Result<ExportPayload> {
        let format = ExportFormat::parse(format)?;
        let metadata = self.require_backup(id).await?;
        if metadata.status != BackupStatus::Completed {
            return Err(BackupError::Validation(format!(
                "backup {id} cannot be exported in status {}",
                metadata.status.as_str()
            )));
        }
        let artifact = self.snapshots.read_artifact(&metadata).await?;
        render_export(&metadata, &artifact, format)
    }

    /// Dry-run validation of restore options: reports chain and artifact
    /// problems plus per-table presence and row counts, without touching
    /// the store.
    pub async fn validate_restore_options(
        &self,
        id: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreValidationReport> {
        let metadata = self.require_backup(id).await?;
        let mut errors = Vec::new();

        if metadata.status != BackupStatus::Completed {
            errors.push(format!(
                "backup is not restorable in status {}",
                metadata.status.as_str()
            ));
        }

        let chain = if errors.is_empty() {
            let resolved = match options.point_in_time {
                Some(target) => {
                    resolve_point_in_time(self.store.as_ref(), &metadata, target).await
                }
                None => resolve_chain(self.store.as_ref(), &metadata).await,
            };
            match resolved {
                Ok(chain) => Some(chain),
                Err(e) => {
                    errors.push(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        let mut table_checks = Vec::new();
        if let Some(chain) = &chain {
            for member in chain {
                match member.file_path.as_ref() {
                    Some(path) if path.exists() => {}
                    _ => errors.push(format!("artifact file missing for backup {}", member.id)),
                }
            }

            if errors.is_empty() {
                let artifact = self.snapshots.read_artifact(&chain[0]).await?;
                for table in &artifact.tables {
                    let live_rows: Option<i64> = sqlx::query_scalar(&format!(
                        "SELECT COUNT(*) FROM {}",
                        super::snapshot::quote_ident(&table.name)
                    ))
                    .fetch_one(&self.pool)
                    .await
                    .ok();
                    table_checks.push(TableCheck {
                        table: table.name.clone(),
                        in_backup: true,
                        in_live: live_rows.is_some(),
                        backup_rows: table.rows.len() as u64,
                        live_rows: live_rows.map(|n| n as u64),
                    });
                }
            }
        }

        Ok(RestoreValidationReport {
            is_valid: errors.is_empty(),
            table_checks,
            errors,
        })
    }

    // ---- delete / retention -----------------------------------------

    /// Delete a backup's artifact and catalog row. Rejected while completed
    /// incremental backups still reference it as their parent.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        self.require_backup(id).await?;

        let _guard = self.op_lock.lock().await;
        let metadata = self.require_backup(id).await?;
        let referencing = self
            .store
            .children_of(id)
            .await?
            .into_iter()
            .filter(|child| child.status == BackupStatus::Completed)
            .count();
        if referencing > 0 {
            return Err(BackupError::Conflict(format!(
                "backup {id} is referenced as parent by {referencing} completed incremental backup(s)"
            )));
        }

        self.remove_backup(&metadata).await?;
        info!(backup_id = %id, "Backup deleted");
        Ok(())
    }

    /// Retention sweep: delete completed backups created before `cutoff`.
    /// With `cascade_children` the backup's incremental descendants are
    /// removed first (deepest last in discovery order, deleted in reverse);
    /// without it, aged parents with surviving children are retained.
    pub async fn cleanup_aged_backups(
        &self,
        cutoff: DateTime<Utc>,
        triggered_by: Option<&str>,
        cascade_children: bool,
    ) -> Result<u32> {
        let _guard = self.op_lock.lock().await;
        let aged = self.store.completed_older_than(cutoff, triggered_by).await?;
        let mut deleted = 0u32;

        for backup in aged {
            // May already be gone from an earlier cascade this sweep.
            if self.store.get(&backup.id).await?.is_none() {
                continue;
            }
            let descendants = self.collect_descendants(&backup).await?;
            if !descendants.is_empty() && !cascade_children {
                debug!(
                    backup_id = %backup.id,
                    children = descendants.len(),
                    "Retaining aged backup with surviving incremental children"
                );
                continue;
            }
            match self.delete_subtree(&backup, descendants).await {
                Ok(count) => deleted += count,
                Err(e) => {
                    error!(
                        backup_id = %backup.id,
                        error = %e,
                        "Failed to delete aged backup"
                    );
                }
            }
        }

        self.prune_change_log().await?;

        info!(deleted, "Backup retention cleanup finished");
        Ok(deleted)
    }

    /// Change-log rows at or below every completed backup's snapshot
    /// position can never appear in a future delta; drop them.
    async fn prune_change_log(&self) -> Result<()> {
        let floor: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(snapshot_seq) FROM backup_metadata
             WHERE status = 'completed' AND snapshot_seq IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        if let Some(floor) = floor {
            let pruned = sqlx::query(&format!(
                "DELETE FROM {} WHERE seq <= $1",
                super::snapshot::CHANGE_LOG_TABLE
            ))
            .bind(floor)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if pruned > 0 {
                debug!(pruned, floor, "Pruned change log below the completed snapshot floor");
            }
        }
        Ok(())
    }

    async fn collect_descendants(&self, root: &BackupMetadata) -> Result<Vec<BackupMetadata>> {
        let mut pending = vec![root.id.clone()];
        let mut descendants = Vec::new();
        while let Some(id) = pending.pop() {
            for child in self.store.children_of(&id).await? {
                pending.push(child.id.clone());
                descendants.push(child);
            }
            if descendants.len() > 10_000 {
                return Err(BackupError::engine(
                    "backup descendant walk exceeded sanity bound".to_string(),
                ));
            }
        }
        Ok(descendants)
    }

    async fn delete_subtree(
        &self,
        root: &BackupMetadata,
        descendants: Vec<BackupMetadata>,
    ) -> Result<u32> {
        let mut count = 0u32;
        for backup in descendants.iter().rev() {
            self.remove_backup(backup).await?;
            count += 1;
        }
        self.remove_backup(root).await?;
        Ok(count + 1)
    }

    async fn remove_backup(&self, metadata: &BackupMetadata) -> Result<()> {
        if let Some(path) = metadata.file_path.as_ref() {
            match tokio::fs::remove_file(path).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.delete(&metadata.id).await?;
        Ok(())
    }

    // ---- internals ---------------------------------------------------

    /// Full backup of current state taken before a destructive restore,
    /// while the exclusivity lock is already held.
    async fn pre_restore_backup(&self) -> Result<BackupMetadata> {
        info!("Taking pre-restore backup of current state");
        let metadata = BackupMetadata::new_pending(
            BackupType::Full,
            default_backup_name("pre-restore"),
            Some("automatic backup taken before a restore".to_string()),
            None,
            true,
            TRIGGER_MANUAL.to_string(),
        );
        self.store.insert(&metadata).await?;
        self.run_full_snapshot(metadata, true).await
    }

    async fn load_chain_artifacts(
        &self,
        chain: &[BackupMetadata],
        verify: bool,
    ) -> Result<Vec<SnapshotArtifact>> {
        let mut artifacts = Vec::with_capacity(chain.len());
        for member in chain {
            if verify {
                let verification = self.verifier.verify_artifact(member).await?;
                if !verification.valid {
                    if member.status != BackupStatus::Corrupted {
                        let mut corrupted = member.clone();
                        corrupted.status = BackupStatus::Corrupted;
                        corrupted.error = Some(verification.message());
                        self.store.update(&corrupted).await?;
                    }
                    return Err(BackupError::Integrity(format!(
                        "backup {} failed verification: {}",
                        member.id,
                        verification.message()
                    )));
                }
            }
            artifacts.push(self.snapshots.read_artifact(member).await?);
        }
        Ok(artifacts)
    }

    async fn require_backup(&self, id: &str) -> Result<BackupMetadata> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup {id} not found")))
    }
}

fn ensure_restorable(metadata: &BackupMetadata) -> Result<()> {
    match metadata.status {
        BackupStatus::Completed => Ok(()),
        BackupStatus::Corrupted => Err(BackupError::Integrity(format!(
            "backup {} is corrupted and cannot be restored",
            metadata.id
        ))),
        other => Err(BackupError::Validation(format!(
            "backup {} is not restorable in status {}",
            metadata.id,
            other.as_str()
        ))),
    }
}

fn build_summary(
    chain: &[BackupMetadata],
    stats: super::restore::ApplyStats,
    pre_restore_backup_id: Option<String>,
) -> RestoreSummary {
    let last = chain.last().expect("restore chain is never empty");
    RestoreSummary {
        backup_id: last.id.clone(),
        restored_to: last.created_at,
        tables_restored: stats.tables_restored,
        rows_applied: stats.rows_applied,
        changes_replayed: stats.changes_replayed,
        pre_restore_backup_id,
    }
}

fn default_backup_name(prefix: &str) -> String {
    format!("{prefix}-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SqliteBackupStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn service_fixture() -> (TempDir, SqlitePool, Arc<BackupService>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            artifact_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = Arc::new(SqliteBackupStore::new(pool.clone()));
        let progress = Arc::new(ProgressTracker::new(config.progress_retention_minutes));
        let service = Arc::new(BackupService::new(pool.clone(), store, progress, config));
        service.initialize().await.unwrap();
        (dir, pool, service)
    }

    #[tokio::test]
    async fn test_full_backup_lifecycle() {
        let (_dir, _pool, service) = service_fixture().await;
        let meta = service
            .create_full_backup(CreateBackupOptions::default())
            .await
            .unwrap();
        assert_eq!(meta.status, BackupStatus::Completed);
        assert!(meta.checksum.is_some());
        assert!(meta.completed_at.is_some());
        assert!(meta.file_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_incremental_without_parent_creates_no_row() {
        let (_dir, _pool, service) = service_fixture().await;

        let err = service
            .create_incremental_backup(CreateBackupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));

        let err = service
            .create_incremental_backup(CreateBackupOptions {
                parent_backup_id: Some("no-such-backup".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));

        let listed = service
            .list_backups(&BackupListFilter::default())
            .await
            .unwrap();
        assert!(listed.is_empty(), "no catalog row may be created");
    }

    #[tokio::test]
    async fn test_statistics_reflect_outcomes() {
        let (_dir, _pool, service) = service_fixture().await;
        service
            .create_full_backup(CreateBackupOptions::default())
            .await
            .unwrap();

        let stats = service.backup_statistics().await.unwrap();
        assert_eq!(stats.total_backups, 1);
        assert_eq!(stats.successful_backups_last_7_days, 1);
        assert_eq!(stats.failed_backups_last_7_days, 0);
        assert!(stats.total_backup_size_bytes > 0);
        assert!(stats.latest_backup_time.is_some());
    }

    #[tokio::test]
    async fn test_get_missing_backup_is_not_found() {
        let (_dir, _pool, service) = service_fixture().await;
        let err = service.get_backup_metadata("nope").await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }
}
