pub mod backup_api;
pub mod schedule_api;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::backup::{BackupError, BackupService};
use crate::schedule::{BackupScheduler, ScheduleStore};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BackupService>,
    pub scheduler: Arc<BackupScheduler>,
    pub schedules: Arc<ScheduleStore>,
}

/// The REST contract consumed by the outer routing layer.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Backup operations
        .route("/backup/create", post(backup_api::create_backup))
        .route("/backup/list", get(backup_api::list_backups))
        .route("/backup/stats", get(backup_api::backup_stats))
        .route("/backup/integrity-check", post(backup_api::integrity_check))
        .route("/backup/restore-to-time", post(backup_api::restore_to_time))
        .route(
            "/backup/progress/:progress_id",
            get(backup_api::get_progress).delete(backup_api::clear_progress),
        )
        .route(
            "/backup/:id",
            get(backup_api::get_backup).delete(backup_api::delete_backup),
        )
        .route("/backup/:id/restore", post(backup_api::restore_backup))
        .route("/backup/:id/verify", post(backup_api::verify_backup))
        .route("/backup/:id/export", get(backup_api::export_backup))
        .route("/backup/:id/validate", post(backup_api::validate_restore))
        .route(
            "/backup/:id/restore-partial",
            post(backup_api::restore_partial),
        )
        .route(
            "/backup/:id/restore-with-progress",
            post(backup_api::restore_with_progress),
        )
        // Schedule operations
        .route("/schedule/create", post(schedule_api::create_schedule))
        .route("/schedule", get(schedule_api::list_schedules))
        .route("/schedule/cleanup", post(schedule_api::cleanup))
        .route("/schedule/start", post(schedule_api::start_scheduler))
        .route("/schedule/stop", post(schedule_api::stop_scheduler))
        .route(
            "/schedule/:id",
            get(schedule_api::get_schedule)
                .put(schedule_api::update_schedule)
                .delete(schedule_api::delete_schedule),
        )
        .route("/schedule/:id/execute", post(schedule_api::execute_schedule))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "taskvault-backup",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Maps the backup error taxonomy onto HTTP statuses, with a stable
/// category and human-readable message in the body.
pub struct ApiError(pub BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BackupError::Validation(_) => StatusCode::BAD_REQUEST,
            BackupError::NotFound(_) => StatusCode::NOT_FOUND,
            BackupError::Conflict(_) => StatusCode::CONFLICT,
            BackupError::Integrity(_)
            | BackupError::Database(_)
            | BackupError::Io(_)
            | BackupError::Serialization(_)
            | BackupError::Engine { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.category(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
