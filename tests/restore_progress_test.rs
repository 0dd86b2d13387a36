mod common;

use common::{harness, insert_board, insert_task, task_ids};
use std::time::Duration;
use taskvault::backup::{BackupError, CreateBackupOptions, RestoreOptions, RestoreState};

async fn wait_for_terminal(
    h: &common::TestHarness,
    progress_id: &str,
) -> taskvault::backup::RestoreProgress {
    for _ in 0..200 {
        let record = h
            .service
            .get_restore_progress(progress_id)
            .await
            .expect("progress record exists while restore runs");
        if record.state.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("restore did not reach a terminal state in time");
}

#[tokio::test]
async fn tracked_restore_reports_progress_and_completes() {
    let h = harness().await;
    insert_board(&h.pool, "b1", "inbox").await;
    insert_task(&h.pool, "t1", "b1", "original").await;

    let backup = h
        .service
        .create_full_backup(CreateBackupOptions::default())
        .await
        .unwrap();
    insert_task(&h.pool, "t2", "b1", "will disappear").await;

    let progress_id = h
        .service
        .restore_from_backup_with_progress(&backup.id, RestoreOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&h, &progress_id).await;
    assert_eq!(record.state, RestoreState::Done);
    assert_eq!(record.progress_percent, 100);
    assert!(record.error.is_none());

    assert_eq!(task_ids(&h.pool).await, vec!["t1"]);

    // Explicit clear removes the record; a second clear is a no-op.
    assert!(h.service.clear_restore_progress(&progress_id).await);
    assert!(!h.service.clear_restore_progress(&progress_id).await);
    let err = h
        .service
        .get_restore_progress(&progress_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
}

#[tokio::test]
async fn tracked_restore_failure_is_reported() {
    let h = harness().await;
    insert_board(&h.pool, "b1", "inbox").await;
    insert_task(&h.pool, "t1", "b1", "row").await;

    let backup = h
        .service
        .create_full_backup(CreateBackupOptions::default())
        .await
        .unwrap();

    // Corrupt the artifact so verification fails inside the tracked task.
    let path = backup.file_path.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let progress_id = h
        .service
        .restore_from_backup_with_progress(&backup.id, RestoreOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&h, &progress_id).await;
    assert_eq!(record.state, RestoreState::Failed);
    assert!(record.error.is_some());

    // The store was never touched.
    assert_eq!(task_ids(&h.pool).await, vec!["t1"]);
}

#[tokio::test]
async fn missing_progress_id_is_not_found() {
    let h = harness().await;
    let err = h
        .service
        .get_restore_progress("never-created")
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
}
