mod common;

use chrono::{Duration, Utc};
use common::{harness, insert_board, insert_task};
use std::sync::Arc;
use taskvault::backup::{BackupListFilter, BackupStatus, BackupType};
use taskvault::schedule::{
    BackupScheduler, NewSchedule, ScheduleStore, ScheduleUpdate, SchedulerSettings,
};

async fn schedule_fixture(
    h: &common::TestHarness,
) -> (Arc<ScheduleStore>, Arc<BackupScheduler>) {
    let schedules = Arc::new(ScheduleStore::new(h.pool.clone()));
    schedules.initialize().await.unwrap();
    let scheduler = Arc::new(BackupScheduler::new(
        Arc::clone(&h.service),
        Arc::clone(&schedules),
        SchedulerSettings::default(),
    ));
    (schedules, scheduler)
}

fn nightly_full() -> NewSchedule {
    NewSchedule {
        name: "nightly-full".to_string(),
        description: Some("nightly full backup".to_string()),
        cron_expression: "0 2 * * *".to_string(),
        backup_type: BackupType::Full,
        enabled: None,
        retention_days: None,
        compression_enabled: None,
        verification_enabled: None,
    }
}

#[tokio::test]
async fn execute_schedule_produces_one_completed_full_backup() {
    let h = harness().await;
    let (schedules, scheduler) = schedule_fixture(&h).await;
    insert_board(&h.pool, "b1", "inbox").await;
    insert_task(&h.pool, "t1", "b1", "row").await;

    let schedule = schedules.create(nightly_full()).await.unwrap();
    let metadata = scheduler.execute_schedule(&schedule.id).await.unwrap();

    assert_eq!(metadata.backup_type, BackupType::Full);
    assert_eq!(metadata.status, BackupStatus::Completed);
    assert_eq!(metadata.triggered_by, schedule.id);

    let listed = h
        .service
        .list_backups(&BackupListFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn incremental_schedule_falls_back_to_full_then_chains() {
    let h = harness().await;
    let (schedules, scheduler) = schedule_fixture(&h).await;
    insert_board(&h.pool, "b1", "inbox").await;

    let schedule = schedules
        .create(NewSchedule {
            name: "rolling".to_string(),
            backup_type: BackupType::Incremental,
            ..nightly_full()
        })
        .await
        .unwrap();

    // No completed backup exists yet: the first run takes a full backup.
    let first = scheduler.execute_schedule(&schedule.id).await.unwrap();
    assert_eq!(first.backup_type, BackupType::Full);

    insert_task(&h.pool, "t1", "b1", "between runs").await;

    // The second run chains onto the most recent completed backup.
    let second = scheduler.execute_schedule(&schedule.id).await.unwrap();
    assert_eq!(second.backup_type, BackupType::Incremental);
    assert_eq!(second.parent_backup_id.as_deref(), Some(first.id.as_str()));
}

#[tokio::test]
async fn cleanup_deletes_backups_past_retention() {
    let h = harness().await;
    let (schedules, scheduler) = schedule_fixture(&h).await;
    insert_board(&h.pool, "b1", "inbox").await;

    let schedule = schedules.create(nightly_full()).await.unwrap();
    let aged = scheduler.execute_schedule(&schedule.id).await.unwrap();
    let fresh = scheduler.execute_schedule(&schedule.id).await.unwrap();

    // Age the first backup past the schedule's 30 day retention.
    let old = Utc::now() - Duration::days(60);
    sqlx::query("UPDATE backup_metadata SET created_at = $1, completed_at = $1 WHERE id = $2")
        .bind(old)
        .bind(&aged.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let deleted = scheduler.cleanup_old_backups().await.unwrap();
    assert_eq!(deleted, 1);

    let listed = h
        .service
        .list_backups(&BackupListFilter::default())
        .await
        .unwrap();
    let ids: Vec<&str> = listed.iter().map(|b| b.id.as_str()).collect();
    assert!(!ids.contains(&aged.id.as_str()));
    assert!(ids.contains(&fresh.id.as_str()));
}

#[tokio::test]
async fn cleanup_cascades_children_before_aged_parent() {
    let h = harness().await;
    let (schedules, scheduler) = schedule_fixture(&h).await;
    insert_board(&h.pool, "b1", "inbox").await;

    let schedule = schedules
        .create(NewSchedule {
            name: "rolling".to_string(),
            backup_type: BackupType::Incremental,
            ..nightly_full()
        })
        .await
        .unwrap();

    let parent = scheduler.execute_schedule(&schedule.id).await.unwrap();
    insert_task(&h.pool, "t1", "b1", "delta").await;
    let child = scheduler.execute_schedule(&schedule.id).await.unwrap();
    assert_eq!(child.parent_backup_id.as_deref(), Some(parent.id.as_str()));

    // Only the parent is past retention, but deleting it alone would
    // orphan the chain; the child goes with it.
    let old = Utc::now() - Duration::days(60);
    sqlx::query("UPDATE backup_metadata SET created_at = $1, completed_at = $1 WHERE id = $2")
        .bind(old)
        .bind(&parent.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let deleted = scheduler.cleanup_old_backups().await.unwrap();
    assert_eq!(deleted, 2);

    let listed = h
        .service
        .list_backups(&BackupListFilter::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn scheduler_start_stop_and_refresh() {
    let h = harness().await;
    let (schedules, scheduler) = schedule_fixture(&h).await;

    let schedule = schedules.create(nightly_full()).await.unwrap();

    assert!(!scheduler.is_running().await);
    scheduler.start().await.unwrap();
    assert!(scheduler.is_running().await);

    // Disabling the schedule and refreshing drops its timer without
    // stopping the scheduler.
    schedules
        .update(
            &schedule.id,
            ScheduleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    scheduler.refresh().await.unwrap();
    assert!(scheduler.is_running().await);

    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running().await);
    // Stopping twice is harmless.
    scheduler.stop().await.unwrap();
}
