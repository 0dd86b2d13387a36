use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::{ApiResult, AppState};
use crate::backup::{BackupError, BackupMetadata};
use crate::schedule::{NewSchedule, ScheduleConfig, ScheduleUpdate};

pub async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<NewSchedule>,
) -> ApiResult<(StatusCode, Json<ScheduleConfig>)> {
    let schedule = state.schedules.create(request).await?;
    state.scheduler.refresh().await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list_schedules(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ScheduleConfig>>> {
    Ok(Json(state.schedules.list().await?))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduleConfig>> {
    let schedule = state
        .schedules
        .get(&id)
        .await?
        .ok_or_else(|| BackupError::NotFound(format!("schedule {id} not found")))?;
    Ok(Json(schedule))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScheduleUpdate>,
) -> ApiResult<Json<ScheduleConfig>> {
    let schedule = state.schedules.update(&id, request).await?;
    state.scheduler.refresh().await?;
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.schedules.delete(&id).await?;
    state.scheduler.refresh().await?;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

pub async fn execute_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BackupMetadata>> {
    Ok(Json(state.scheduler.execute_schedule(&id).await?))
}

pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let deleted = state.scheduler.cleanup_old_backups().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn start_scheduler(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.scheduler.start().await?;
    Ok(Json(json!({ "running": true })))
}

pub async fn stop_scheduler(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.scheduler.stop().await?;
    Ok(Json(json!({ "running": false })))
}
