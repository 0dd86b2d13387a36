use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// States a progress-tracked restore moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Queued,
    Verifying,
    Staging,
    Applying,
    Finalizing,
    Done,
    Failed,
}

impl RestoreState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreState::Done | RestoreState::Failed)
    }
}

/// Ephemeral record for one in-flight or recently finished restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    pub id: String,
    pub state: RestoreState,
    pub total_steps: u32,
    pub current_step: u32,
    pub progress_percent: u8,
    pub message: String,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory registry mapping a restore operation id to its progress.
/// Records are not persisted across restarts; finished entries are removed
/// by an explicit eviction sweep once the retention window passes.
pub struct ProgressTracker {
    operations: RwLock<HashMap<String, RestoreProgress>>,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(retention_minutes: i64) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            retention: Duration::minutes(retention_minutes),
        }
    }

    /// Register a new restore and return its progress id.
    pub async fn start(&self, total_steps: u32, message: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = RestoreProgress {
            id: id.clone(),
            state: RestoreState::Queued,
            total_steps,
            current_step: 0,
            progress_percent: 0,
            message: message.into(),
            error: None,
            updated_at: Utc::now(),
        };
        self.operations.write().await.insert(id.clone(), record);
        id
    }

    /// Record a step transition. Updates after the record was cleared are
    /// dropped silently; clearing must never affect the running restore.
    pub async fn update(
        &self,
        id: &str,
        state: RestoreState,
        current_step: u32,
        total_steps: u32,
        message: impl Into<String>,
    ) {
        let mut operations = self.operations.write().await;
        if let Some(record) = operations.get_mut(id) {
            record.state = state;
            record.current_step = current_step.min(total_steps);
            record.total_steps = total_steps;
            record.progress_percent = if total_steps == 0 {
                0
            } else {
                ((current_step.min(total_steps) as u64 * 100) / total_steps as u64) as u8
            };
            record.message = message.into();
            record.updated_at = Utc::now();
        }
    }

    pub async fn complete(&self, id: &str, message: impl Into<String>) {
        let mut operations = self.operations.write().await;
        if let Some(record) = operations.get_mut(id) {
            record.state = RestoreState::Done;
            record.current_step = record.total_steps;
            record.progress_percent = 100;
            record.message = message.into();
            record.updated_at = Utc::now();
        }
    }

    pub async fn fail(&self, id: &str, error: impl Into<String>) {
        let mut operations = self.operations.write().await;
        if let Some(record) = operations.get_mut(id) {
            let error = error.into();
            record.state = RestoreState::Failed;
            record.message = format!("restore failed: {error}");
            record.error = Some(error);
            record.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, id: &str) -> Option<RestoreProgress> {
        self.operations.read().await.get(id).cloned()
    }

    /// Remove a record explicitly. Returns whether it existed.
    pub async fn clear(&self, id: &str) -> bool {
        self.operations.write().await.remove(id).is_some()
    }

    /// Drop terminal records older than the retention window.
    pub async fn evict_stale(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut operations = self.operations.write().await;
        let before = operations.len();
        operations.retain(|_, record| !(record.state.is_terminal() && record.updated_at < cutoff));
        let evicted = before - operations.len();
        if evicted > 0 {
            debug!(evicted, "Evicted stale restore progress records");
        }
        evicted
    }

    /// Spawn the periodic eviction sweep. The task runs for the lifetime of
    /// the process; the tracker is shared behind an `Arc`.
    pub fn spawn_eviction_sweep(self: &Arc<Self>, interval_seconds: u64) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                tracker.evict_stale().await;
            }
        });
    }
}
