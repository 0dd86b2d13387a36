#![allow(dead_code)]

use sqlx::SqlitePool;
use std::sync::Arc;
use taskvault::backup::{
    open_pool, BackupConfig, BackupService, ProgressTracker, SqliteBackupStore,
};
use tempfile::TempDir;

/// File-backed store with the task-tracking domain tables, plus a fully
/// initialized backup service writing artifacts into the same tempdir.
pub struct TestHarness {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub service: Arc<BackupService>,
    pub progress: Arc<ProgressTracker>,
}

pub async fn harness() -> TestHarness {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir.path().join("store.db")).await.unwrap();

    sqlx::query("CREATE TABLE boards (id TEXT PRIMARY KEY, name TEXT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            board_id TEXT NOT NULL REFERENCES boards(id),
            title TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "CREATE TABLE notes (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            body TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    let config = BackupConfig {
        artifact_directory: dir.path().join("artifacts"),
        ..Default::default()
    };
    let store = Arc::new(SqliteBackupStore::new(pool.clone()));
    let progress = Arc::new(ProgressTracker::new(config.progress_retention_minutes));
    let service = Arc::new(BackupService::new(
        pool.clone(),
        store,
        Arc::clone(&progress),
        config,
    ));
    service.initialize().await.unwrap();

    TestHarness {
        dir,
        pool,
        service,
        progress,
    }
}

pub async fn insert_board(pool: &SqlitePool, id: &str, name: &str) {
    sqlx::query("INSERT INTO boards (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn insert_task(pool: &SqlitePool, id: &str, board_id: &str, title: &str) {
    sqlx::query("INSERT INTO tasks (id, board_id, title) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(board_id)
        .bind(title)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn delete_task(pool: &SqlitePool, id: &str) {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn task_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn task_ids(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT id FROM tasks ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}

pub async fn board_names(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM boards ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}
