use super::{validate_cron_expression, ScheduleConfig, ScheduleStore};
use crate::backup::{
    BackupError, BackupMetadata, BackupService, BackupType, CreateBackupOptions, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What retention cleanup does with an aged parent that still has
/// completed incremental children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Delete the children first, then the aged parent (default).
    Cascade,
    /// Keep aged parents alive while children reference them.
    RetainParents,
}

impl CascadePolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cascade" => Ok(CascadePolicy::Cascade),
            "retain_parents" => Ok(CascadePolicy::RetainParents),
            other => Err(BackupError::Validation(format!(
                "unknown cascade policy: {other} (expected cascade or retain_parents)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Scheduled runs longer than this are logged as anomalies. They are
    /// never aborted; restores and backups run to completion.
    pub max_run_seconds: u64,
    pub cascade_policy: CascadePolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_run_seconds: 1800,
            cascade_policy: CascadePolicy::Cascade,
        }
    }
}

/// Drives recurring backups: one cron job per enabled schedule, manual
/// execution, and retention cleanup. The scheduler owns no backup state of
/// its own; every firing goes through the `BackupService`.
pub struct BackupScheduler {
    service: Arc<BackupService>,
    schedules: Arc<ScheduleStore>,
    settings: SchedulerSettings,
    inner: Mutex<Option<JobScheduler>>,
    jobs: Mutex<HashMap<String, Uuid>>,
}

impl BackupScheduler {
    pub fn new(
        service: Arc<BackupService>,
        schedules: Arc<ScheduleStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            service,
            schedules,
            settings,
            inner: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start evaluating timers for every enabled schedule. A schedule whose
    /// cron expression fails to register is logged and skipped; it never
    /// prevents the other schedules from running.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            warn!("Backup scheduler is already running");
            return Ok(());
        }

        let mut scheduler = JobScheduler::new().await.map_err(|e| {
            BackupError::engine(format!("failed to initialize job scheduler: {e}"))
        })?;

        let mut jobs = self.jobs.lock().await;
        for schedule in self.schedules.list().await? {
            if !schedule.enabled {
                continue;
            }
            match self.register_job(&mut scheduler, &schedule).await {
                Ok(job_id) => {
                    jobs.insert(schedule.id.clone(), job_id);
                }
                Err(e) => {
                    error!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "Failed to register schedule; skipping it"
                    );
                }
            }
        }

        scheduler
            .start()
            .await
            .map_err(|e| BackupError::engine(format!("failed to start job scheduler: {e}")))?;

        info!(schedules = jobs.len(), "Backup scheduler started");
        *inner = Some(scheduler);
        Ok(())
    }

    /// Stop evaluating all timers. In-flight runs finish on their own.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.take() {
            Some(mut scheduler) => {
                scheduler.shutdown().await.map_err(|e| {
                    BackupError::engine(format!("failed to shut down job scheduler: {e}"))
                })?;
                self.jobs.lock().await.clear();
                info!("Backup scheduler stopped");
            }
            None => {
                warn!("Backup scheduler is not running");
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Re-sync cron jobs with the schedule catalog. Invoked after schedule
    /// definitions change; a no-op while the scheduler is stopped.
    pub async fn refresh(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(scheduler) = inner.as_mut() else {
            return Ok(());
        };

        let mut jobs = self.jobs.lock().await;
        for (schedule_id, job_id) in jobs.drain() {
            if let Err(e) = scheduler.remove(&job_id).await {
                warn!(
                    schedule_id = %schedule_id,
                    error = %e,
                    "Failed to remove stale cron job"
                );
            }
        }
        for schedule in self.schedules.list().await? {
            if !schedule.enabled {
                continue;
            }
            match self.register_job(scheduler, &schedule).await {
                Ok(job_id) => {
                    jobs.insert(schedule.id.clone(), job_id);
                }
                Err(e) => {
                    error!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "Failed to re-register schedule"
                    );
                }
            }
        }
        debug!(schedules = jobs.len(), "Scheduler jobs refreshed");
        Ok(())
    }

    /// Run one schedule immediately, regardless of its timer or the
    /// scheduler's running state.
    #[instrument(skip(self))]
    pub async fn execute_schedule(&self, schedule_id: &str) -> Result<BackupMetadata> {
        run_schedule(
            Arc::clone(&self.service),
            Arc::clone(&self.schedules),
            schedule_id,
            self.settings.max_run_seconds,
        )
        .await
    }

    /// Apply every schedule's retention policy.
    #[instrument(skip(self))]
    pub async fn cleanup_old_backups(&self) -> Result<u32> {
        let mut total = 0u32;
        for schedule in self.schedules.list().await? {
            if schedule.retention_days == 0 {
                continue;
            }
            let cutoff = Utc::now() - chrono::Duration::days(schedule.retention_days as i64);
            match self
                .service
                .cleanup_aged_backups(
                    cutoff,
                    Some(&schedule.id),
                    self.settings.cascade_policy == CascadePolicy::Cascade,
                )
                .await
            {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    error!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "Retention cleanup failed for schedule"
                    );
                }
            }
        }
        info!(deleted = total, "Retention cleanup pass complete");
        Ok(total)
    }

    async fn register_job(
        &self,
        scheduler: &mut JobScheduler,
        schedule: &ScheduleConfig,
    ) -> Result<Uuid> {
        let cron = validate_cron_expression(&schedule.cron_expression)?;
        let service = Arc::clone(&self.service);
        let schedules = Arc::clone(&self.schedules);
        let schedule_id = schedule.id.clone();
        let max_run_seconds = self.settings.max_run_seconds;

        let job = Job::new_async(cron.as_str(), move |_job_id, _scheduler| {
            let service = Arc::clone(&service);
            let schedules = Arc::clone(&schedules);
            let schedule_id = schedule_id.clone();
            Box::pin(async move {
                match run_schedule(service, schedules, &schedule_id, max_run_seconds).await {
                    Ok(metadata) => {
                        info!(
                            schedule_id = %schedule_id,
                            backup_id = %metadata.id,
                            "Scheduled backup completed"
                        );
                    }
                    Err(e) => {
                        // Failures are isolated per schedule; the timer
                        // stays armed for the next firing.
                        error!(
                            schedule_id = %schedule_id,
                            error = %e,
                            "Scheduled backup failed"
                        );
                    }
                }
            })
        })
        .map_err(|e| BackupError::engine(format!("failed to create cron job: {e}")))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| BackupError::engine(format!("failed to add cron job: {e}")))
    }
}

async fn run_schedule(
    service: Arc<BackupService>,
    schedules: Arc<ScheduleStore>,
    schedule_id: &str,
    max_run_seconds: u64,
) -> Result<BackupMetadata> {
    let schedule = schedules
        .get(schedule_id)
        .await?
        .ok_or_else(|| BackupError::NotFound(format!("schedule {schedule_id} not found")))?;

    let started = std::time::Instant::now();
    let options = CreateBackupOptions {
        name: Some(format!(
            "{}-{}",
            schedule.name,
            Utc::now().format("%Y%m%d-%H%M%S")
        )),
        description: Some(format!("scheduled backup for '{}'", schedule.name)),
        compress: Some(schedule.compression_enabled),
        verify: Some(schedule.verification_enabled),
        parent_backup_id: None,
        triggered_by: Some(schedule.id.clone()),
    };

    let metadata = match schedule.backup_type {
        BackupType::Full => service.create_full_backup(options).await?,
        BackupType::Incremental => match service.latest_completed_backup().await? {
            Some(parent) => {
                service
                    .create_incremental_backup(CreateBackupOptions {
                        parent_backup_id: Some(parent.id),
                        ..options
                    })
                    .await?
            }
            None => {
                info!(
                    schedule_id = %schedule.id,
                    "No completed backup to chain from, taking a full backup instead"
                );
                service.create_full_backup(options).await?
            }
        },
    };

    let elapsed = started.elapsed().as_secs();
    if elapsed > max_run_seconds {
        warn!(
            schedule_id = %schedule.id,
            elapsed_seconds = elapsed,
            max_run_seconds,
            "Scheduled backup exceeded the configured maximum duration"
        );
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_policy_parse() {
        assert_eq!(
            CascadePolicy::parse("cascade").unwrap(),
            CascadePolicy::Cascade
        );
        assert_eq!(
            CascadePolicy::parse("retain_parents").unwrap(),
            CascadePolicy::RetainParents
        );
        assert!(CascadePolicy::parse("keep").is_err());
    }

    #[test]
    fn test_settings_default() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.max_run_seconds, 1800);
        assert_eq!(settings.cascade_policy, CascadePolicy::Cascade);
    }
}
