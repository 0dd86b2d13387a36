use super::progress::{ProgressTracker, RestoreState};
use super::snapshot::{ensure_capture_triggers, quote_ident, tracked_tables, ChangeOp, ChangeRecord, SnapshotArtifact, TableSnapshot};
use super::{BackupError, BackupMetadata, BackupStatus, BackupStore, BackupType, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Upper bound on parent-chain length; anything deeper is treated as
/// ambiguous parentage.
const MAX_CHAIN_DEPTH: usize = 1024;

/// Resolve the ordered restore chain for a backup: its full ancestor first,
/// then every incremental down to the target. Rejects missing, unfinished,
/// corrupted, cyclic, or out-of-order links.
pub async fn resolve_chain(
    store: &dyn BackupStore,
    target: &BackupMetadata,
) -> Result<Vec<BackupMetadata>> {
    let mut chain = vec![target.clone()];
    let mut seen: HashSet<String> = HashSet::from([target.id.clone()]);
    let mut current = target.clone();

    while current.backup_type == BackupType::Incremental {
        if chain.len() > MAX_CHAIN_DEPTH {
            return Err(BackupError::Validation(format!(
                "backup chain for {} exceeds maximum depth", target.id
            )));
        }
        let parent_id = current.parent_backup_id.clone().ok_or_else(|| {
            BackupError::Validation(format!(
                "incremental backup {} has no parent recorded", current.id
            ))
        })?;
        if !seen.insert(parent_id.clone()) {
            return Err(BackupError::Validation(format!(
                "backup chain for {} has cyclic parentage at {parent_id}", target.id
            )));
        }
        let parent = store.get(&parent_id).await?.ok_or_else(|| {
            BackupError::Validation(format!(
                "backup chain is broken: parent {parent_id} of {} no longer exists", current.id
            ))
        })?;
        match parent.status {
            BackupStatus::Completed => {}
            BackupStatus::Corrupted => {
                return Err(BackupError::Integrity(format!(
                    "backup chain member {parent_id} is corrupted"
                )))
            }
            _ => {
                return Err(BackupError::Validation(format!(
                    "backup chain member {parent_id} is not completed"
                )))
            }
        }
        if current.created_at < parent.created_at {
            return Err(BackupError::Validation(format!(
                "backup {} was created before its parent {parent_id}; chain order is ambiguous",
                current.id
            )));
        }
        chain.push(parent.clone());
        current = parent;
    }

    chain.reverse();
    debug!(target = %target.id, depth = chain.len(), "Resolved restore chain");
    Ok(chain)
}

/// Resolve the minimal chain reaching `target_time`, starting from a known
/// backup. The chain is the target's ancestry truncated to members created
/// at or before the target time.
pub async fn resolve_point_in_time(
    store: &dyn BackupStore,
    start: &BackupMetadata,
    target_time: DateTime<Utc>,
) -> Result<Vec<BackupMetadata>> {
    let chain = resolve_chain(store, start).await?;
    validate_target_time(store, &chain[0], target_time).await?;

    let members: Vec<BackupMetadata> = chain
        .into_iter()
        .take_while(|member| member.created_at <= target_time)
        .collect();
    if members.is_empty() {
        return Err(BackupError::Validation(format!(
            "target time {target_time} predates the chain's full backup"
        )));
    }
    Ok(members)
}

/// Resolve a chain for `target_time` with no starting backup: the latest
/// completed full backup at or before the target, extended with completed
/// incrementals until the target time is reached. When a member has several
/// qualifying children the one created latest is followed.
pub async fn resolve_point_in_time_auto(
    store: &dyn BackupStore,
    target_time: DateTime<Utc>,
) -> Result<Vec<BackupMetadata>> {
    let latest = store
        .latest_completed(None)
        .await?
        .ok_or_else(|| BackupError::NotFound("no completed backups available".to_string()))?;
    if target_time > latest.created_at {
        return Err(BackupError::Validation(format!(
            "target time {target_time} postdates the latest available backup ({})",
            latest.created_at
        )));
    }

    let fulls = store
        .list(&super::BackupListFilter {
            backup_type: Some(BackupType::Full),
            status: Some(BackupStatus::Completed),
            ..Default::default()
        })
        .await?;
    let root = fulls
        .into_iter()
        .filter(|b| b.created_at <= target_time)
        .max_by_key(|b| b.created_at)
        .ok_or_else(|| {
            BackupError::Validation(format!(
                "target time {target_time} predates the earliest available full backup"
            ))
        })?;

    let mut chain = vec![root];
    let mut seen: HashSet<String> = chain.iter().map(|b| b.id.clone()).collect();
    loop {
        let tip = chain.last().expect("chain is never empty");
        let next = store
            .children_of(&tip.id)
            .await?
            .into_iter()
            .filter(|child| {
                child.status == BackupStatus::Completed
                    && child.backup_type == BackupType::Incremental
                    && child.created_at <= target_time
            })
            .max_by_key(|child| child.created_at);
        match next {
            Some(child) => {
                if !seen.insert(child.id.clone()) || chain.len() > MAX_CHAIN_DEPTH {
                    return Err(BackupError::Validation(
                        "backup chain has cyclic parentage".to_string(),
                    ));
                }
                chain.push(child);
            }
            None => break,
        }
    }
    Ok(chain)
}

async fn validate_target_time(
    store: &dyn BackupStore,
    root: &BackupMetadata,
    target_time: DateTime<Utc>,
) -> Result<()> {
    if target_time < root.created_at {
        return Err(BackupError::Validation(format!(
            "target time {target_time} predates the earliest available full backup ({})",
            root.created_at
        )));
    }
    if let Some(latest) = store.latest_completed(None).await? {
        if target_time > latest.created_at {
            return Err(BackupError::Validation(format!(
                "target time {target_time} postdates the latest available backup ({})",
                latest.created_at
            )));
        }
    }
    Ok(())
}

/// What to apply and how. `tables: None` means a whole-store restore.
pub struct RestorePlan<'a> {
    pub chain: &'a [BackupMetadata],
    pub artifacts: &'a [SnapshotArtifact],
    pub tables: Option<&'a [String]>,
    pub include_schema: bool,
    pub allow_dangling_references: bool,
    pub validate_after: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    pub tables_restored: Vec<String>,
    pub rows_applied: u64,
    pub changes_replayed: u64,
}

/// Applies resolved backup chains to the live store. Every apply runs in a
/// single transaction: the store reflects either the complete restored
/// state or none of it.
pub struct RestoreEngine {
    pool: SqlitePool,
}

impl RestoreEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn apply(
        &self,
        plan: RestorePlan<'_>,
        progress: Option<(&ProgressTracker, &str)>,
    ) -> Result<ApplyStats> {
        let full = plan.artifacts.first().ok_or_else(|| {
            BackupError::engine("restore chain resolved to no artifacts".to_string())
        })?;
        if full.backup_type != BackupType::Full {
            return Err(BackupError::engine(format!(
                "restore chain does not start with a full backup (got {})",
                full.backup_type.as_str()
            )));
        }

        let selected: Vec<&TableSnapshot> = match plan.tables {
            Some(tables) => {
                if tables.is_empty() {
                    return Err(BackupError::Validation(
                        "no tables selected for partial restore".to_string(),
                    ));
                }
                let mut selected = Vec::with_capacity(tables.len());
                for name in tables {
                    let snapshot = full.tables.iter().find(|t| &t.name == name).ok_or_else(|| {
                        BackupError::Validation(format!(
                            "table {name} is not present in the backup"
                        ))
                    })?;
                    selected.push(snapshot);
                }
                selected
            }
            None => full.tables.iter().collect(),
        };

        let incrementals = &plan.artifacts[1..];
        let total_steps = 2 + selected.len() as u32 + incrementals.len() as u32;
        let mut step = 1u32;
        report(progress, RestoreState::Staging, step, total_steps, "staging restore").await;

        let mut stats = ApplyStats::default();
        let mut tx = self.pool.begin().await?;

        if plan.tables.is_none() {
            // Whole-store restore: rows of tracked tables missing from the
            // artifact are cleared so no post-backup table leaks through.
            let live = tracked_tables(&mut *tx).await?;
            for table in live {
                if !full.tables.iter().any(|t| t.name == table) {
                    sqlx::query(&format!("DELETE FROM {}", quote_ident(&table)))
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for (index, snapshot) in selected.iter().enumerate() {
            step += 1;
            report(
                progress,
                RestoreState::Applying,
                step,
                total_steps,
                format!("applying table {} ({} of {})", snapshot.name, index + 1, selected.len()),
            )
            .await;

            let exists = table_exists(&mut tx, &snapshot.name).await?;
            if plan.include_schema || !exists {
                if !plan.include_schema && plan.tables.is_some() {
                    return Err(BackupError::Validation(format!(
                        "table {} does not exist in the live store; set includeSchema to recreate it",
                        snapshot.name
                    )));
                }
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&snapshot.name)))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&snapshot.create_sql).execute(&mut *tx).await?;
                ensure_capture_triggers(&mut *tx, &snapshot.name).await?;
            } else {
                sqlx::query(&format!("DELETE FROM {}", quote_ident(&snapshot.name)))
                    .execute(&mut *tx)
                    .await?;
            }

            for row in &snapshot.rows {
                insert_row(&mut tx, snapshot, row).await?;
                stats.rows_applied += 1;
            }
            stats.tables_restored.push(snapshot.name.clone());
        }

        for (index, artifact) in incrementals.iter().enumerate() {
            step += 1;
            report(
                progress,
                RestoreState::Applying,
                step,
                total_steps,
                format!("replaying incremental {} of {}", index + 1, incrementals.len()),
            )
            .await;

            for change in &artifact.changes {
                if let Some(tables) = plan.tables {
                    if !tables.contains(&change.table) {
                        continue;
                    }
                }
                apply_change(&mut tx, change).await?;
                stats.changes_replayed += 1;
            }
        }

        if let Some(tables) = plan.tables {
            self.validate_partial(&mut tx, tables, &plan).await?;
        }

        step = total_steps;
        report(progress, RestoreState::Finalizing, step, total_steps, "finalizing").await;
        tx.commit().await?;

        info!(
            tables = stats.tables_restored.len(),
            rows = stats.rows_applied,
            changes = stats.changes_replayed,
            "Restore applied"
        );
        Ok(stats)
    }

    /// Foreign-key safety for table-scoped restores, evaluated inside the
    /// transaction so failures roll the whole restore back.
    async fn validate_partial(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        tables: &[String],
        plan: &RestorePlan<'_>,
    ) -> Result<()> {
        let mut dangling: Vec<(String, String)> = Vec::new();
        let mut in_scope: Vec<(String, String)> = Vec::new();

        for table in tables {
            let rows = sqlx::query(&format!(
                "PRAGMA foreign_key_check({})",
                quote_ident(table)
            ))
            .fetch_all(&mut **tx)
            .await?;
            for row in rows {
                let child: String = row.try_get(0)?;
                let parent: String = row.try_get(2)?;
                if tables.contains(&parent) {
                    in_scope.push((child, parent));
                } else {
                    dangling.push((child, parent));
                }
            }
        }

        if !dangling.is_empty() && !plan.allow_dangling_references {
            let (child, parent) = &dangling[0];
            return Err(BackupError::Validation(format!(
                "partial restore of {child} would reference missing rows in un-restored table \
                 {parent} ({} violation(s)); set allowDanglingReferences to accept this risk",
                dangling.len()
            )));
        }
        if plan.validate_after && !in_scope.is_empty() {
            let (child, parent) = &in_scope[0];
            return Err(BackupError::Integrity(format!(
                "post-restore validation failed: {} violation(s) between restored tables, \
                 first {child} -> {parent}",
                in_scope.len()
            )));
        }
        if !dangling.is_empty() {
            warn!(
                violations = dangling.len(),
                "Partial restore committed with accepted dangling references"
            );
        }
        Ok(())
    }
}

async fn report(
    progress: Option<(&ProgressTracker, &str)>,
    state: RestoreState,
    step: u32,
    total: u32,
    message: impl Into<String>,
) {
    if let Some((tracker, id)) = progress {
        tracker.update(id, state, step, total, message).await;
    }
}

async fn table_exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = $1",
    )
    .bind(table)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(found.is_some())
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    snapshot: &TableSnapshot,
    row: &Value,
) -> Result<()> {
    let object = row.as_object().ok_or_else(|| {
        BackupError::engine(format!(
            "artifact row for table {} is not an object",
            snapshot.name
        ))
    })?;

    let columns = snapshot
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (0..snapshot.columns.len())
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
        quote_ident(&snapshot.name)
    );

    let mut query = sqlx::query(&sql);
    for column in &snapshot.columns {
        query = bind_json_value(query, object.get(column).unwrap_or(&Value::Null));
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

async fn apply_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    change: &ChangeRecord,
) -> Result<()> {
    match change.op {
        ChangeOp::Insert | ChangeOp::Update => {
            let row = change.row.as_ref().and_then(Value::as_object).ok_or_else(|| {
                BackupError::engine(format!(
                    "change record {} for table {} has no row payload",
                    change.seq, change.table
                ))
            })?;
            let columns: Vec<&String> = row.keys().collect();
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (0..columns.len()).map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "INSERT OR REPLACE INTO {} ({column_list}) VALUES ({placeholders})",
                quote_ident(&change.table)
            );
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = bind_json_value(query, &row[column.as_str()]);
            }
            query.execute(&mut **tx).await?;
        }
        ChangeOp::Delete => {
            let pk = change.pk.as_object().ok_or_else(|| {
                BackupError::engine(format!(
                    "change record {} for table {} has no primary key payload",
                    change.seq, change.table
                ))
            })?;
            let conditions = pk
                .keys()
                .map(|k| format!("{} = ?", quote_ident(k)))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!(
                "DELETE FROM {} WHERE {conditions}",
                quote_ident(&change.table)
            );
            let mut query = sqlx::query(&sql);
            for value in pk.values() {
                query = bind_json_value(query, value);
            }
            query.execute(&mut **tx).await?;
        }
    }
    Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_json_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        Value::Object(map) => {
            if let Some(Value::String(encoded)) = map.get("$blob") {
                query.bind(hex::decode(encoded).unwrap_or_default())
            } else {
                query.bind(value.to_string())
            }
        }
        other => query.bind(other.to_string()),
    }
}
