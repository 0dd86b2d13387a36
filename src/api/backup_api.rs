use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiResult, AppState};
use crate::backup::{
    BackupListFilter, BackupMetadata, BackupStatistics, BackupStatus, BackupType,
    CreateBackupOptions, IntegrityReport, PartialRestoreOptions, RestoreOptions, RestoreProgress,
    RestoreSummary, RestoreValidationReport, VerifyReport,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub compress: Option<bool>,
    pub verify: Option<bool>,
    pub parent_backup_id: Option<String>,
}

pub async fn create_backup(
    State(state): State<AppState>,
    Json(request): Json<CreateBackupRequest>,
) -> ApiResult<(StatusCode, Json<BackupMetadata>)> {
    let options = CreateBackupOptions {
        name: request.name,
        description: request.description,
        compress: request.compress,
        verify: request.verify,
        parent_backup_id: request.parent_backup_id,
        triggered_by: None,
    };
    let metadata = match request.backup_type {
        BackupType::Full => state.service.create_full_backup(options).await?,
        BackupType::Incremental => state.service.create_incremental_backup(options).await?,
    };
    Ok((StatusCode::CREATED, Json(metadata)))
}

#[derive(Debug, Deserialize)]
pub struct ListBackupsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    #[serde(rename = "type")]
    pub backup_type: Option<String>,
    pub status: Option<String>,
}

pub async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<ListBackupsQuery>,
) -> ApiResult<Json<Vec<BackupMetadata>>> {
    let filter = BackupListFilter {
        backup_type: query
            .backup_type
            .as_deref()
            .map(BackupType::parse)
            .transpose()?,
        status: query.status.as_deref().map(BackupStatus::parse).transpose()?,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(Json(state.service.list_backups(&filter).await?))
}

pub async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BackupMetadata>> {
    Ok(Json(state.service.get_backup_metadata(&id).await?))
}

pub async fn delete_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.service.delete_backup(&id).await?;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

pub async fn restore_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<RestoreOptions>,
) -> ApiResult<Json<RestoreSummary>> {
    Ok(Json(state.service.restore_from_backup(&id, options).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreToTimeRequest {
    pub target_time: DateTime<Utc>,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub verify: Option<bool>,
    #[serde(default)]
    pub preserve_existing: Option<bool>,
}

pub async fn restore_to_time(
    State(state): State<AppState>,
    Json(request): Json<RestoreToTimeRequest>,
) -> ApiResult<Json<Value>> {
    let options = RestoreOptions {
        verify: request.verify,
        point_in_time: None,
        preserve_existing: request.preserve_existing,
    };
    let summary = state
        .service
        .restore_to_point_in_time(request.backup_id.as_deref(), request.target_time, options)
        .await?;
    Ok(Json(json!({
        "restoredTo": summary.restored_to,
        "backupId": summary.backup_id,
    })))
}

pub async fn verify_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VerifyReport>> {
    Ok(Json(state.service.verify_backup(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

pub async fn export_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format = query.format.as_deref().unwrap_or("json");
    let payload = state.service.export_backup(&id, format).await?;
    let headers = [
        (header::CONTENT_TYPE, payload.content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", payload.file_name),
        ),
    ];
    Ok((headers, payload.body).into_response())
}

pub async fn validate_restore(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<RestoreOptions>,
) -> ApiResult<Json<RestoreValidationReport>> {
    Ok(Json(
        state.service.validate_restore_options(&id, &options).await?,
    ))
}

pub async fn integrity_check(
    State(state): State<AppState>,
) -> ApiResult<Json<IntegrityReport>> {
    Ok(Json(state.service.perform_data_integrity_check().await?))
}

pub async fn restore_partial(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<PartialRestoreOptions>,
) -> ApiResult<Json<RestoreSummary>> {
    Ok(Json(state.service.restore_partial_data(&id, options).await?))
}

pub async fn restore_with_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<RestoreOptions>,
) -> ApiResult<Json<Value>> {
    let progress_id = state
        .service
        .restore_from_backup_with_progress(&id, options)
        .await?;
    Ok(Json(json!({ "progressId": progress_id })))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(progress_id): Path<String>,
) -> ApiResult<Json<RestoreProgress>> {
    Ok(Json(state.service.get_restore_progress(&progress_id).await?))
}

pub async fn clear_progress(
    State(state): State<AppState>,
    Path(progress_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cleared = state.service.clear_restore_progress(&progress_id).await;
    Ok(Json(json!({ "cleared": cleared })))
}

pub async fn backup_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<BackupStatistics>> {
    Ok(Json(state.service.backup_statistics().await?))
}
