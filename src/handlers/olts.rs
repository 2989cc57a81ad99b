use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::models::*;
use crate::AppState;
use super::{created, ApiError};

// ========== OLTs ==========

pub async fn list_olts(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Olt>>, ApiError> {
    Ok(Json(state.olts.list_olts(&scope).await?))
}

pub async fn get_olt(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Olt>, ApiError> {
    Ok(Json(state.olts.get_olt(&scope, id).await?))
}

pub async fn create_olt(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOltRequest>,
) -> Result<(StatusCode, Json<Olt>), ApiError> {
    Ok(created(state.olts.create_olt(&scope, &req).await?))
}

pub async fn test_connection(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionTest>, ApiError> {
    Ok(Json(state.olts.test_connection(&scope, id).await?))
}

pub async fn discover_onus(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DiscoveryResult>, ApiError> {
    Ok(Json(state.olts.discover_onus(&scope, id).await?))
}

pub async fn sync_onus(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SyncResult>, ApiError> {
    Ok(Json(state.olts.sync_onus(&scope, id).await?))
}

pub async fn statistics(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OltStatistics>, ApiError> {
    Ok(Json(state.olts.statistics(&scope, id).await?))
}

// ========== Backups & Configuration ==========

pub async fn create_backup(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<OltBackup>), ApiError> {
    Ok(created(state.olts.create_backup(&scope, id).await?))
}

pub async fn list_backups(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<OltBackup>>, ApiError> {
    Ok(Json(state.olts.list_backups(&scope, id).await?))
}

/// Raw configuration text as a download
pub async fn export_backup(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (backup, content) = state.olts.export_backup(&scope, id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", backup.filename),
            ),
        ],
        content,
    ))
}

pub async fn apply_configuration(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ApplyConfigRequest>,
) -> Result<Json<ConfigApplyResult>, ApiError> {
    Ok(Json(state.olts.apply_configuration(&scope, id, &req.commands).await?))
}

// ========== ONUs ==========

pub async fn list_onus(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Onu>>, ApiError> {
    Ok(Json(state.olts.list_onus(&scope, id).await?))
}

pub async fn get_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Onu>, ApiError> {
    Ok(Json(state.olts.get_onu(&scope, id).await?))
}

pub async fn onu_status(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OnuStatusSnapshot>, ApiError> {
    Ok(Json(state.olts.get_onu_status(&scope, id).await?))
}

pub async fn refresh_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Onu>, ApiError> {
    Ok(Json(state.olts.refresh_onu_status(&scope, id).await?))
}

pub async fn authorize_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OnuCommandResult>, ApiError> {
    Ok(Json(state.olts.authorize_onu(&scope, id).await?))
}

pub async fn unauthorize_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OnuCommandResult>, ApiError> {
    Ok(Json(state.olts.unauthorize_onu(&scope, id).await?))
}

pub async fn reboot_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OnuCommandResult>, ApiError> {
    Ok(Json(state.olts.reboot_onu(&scope, id).await?))
}

pub async fn link_onu(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<LinkOnuRequest>,
) -> Result<Json<Onu>, ApiError> {
    Ok(Json(state.olts.link_onu(&scope, id, req.network_user_id).await?))
}
