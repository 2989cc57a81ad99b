use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::*;
use crate::AppState;
use super::{created, ApiError, MessageResponse};

// ========== Pools ==========

pub async fn list_pools(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<IpPool>>, ApiError> {
    Ok(Json(state.ipam.list_pools(&scope).await?))
}

pub async fn get_pool(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<IpPool>, ApiError> {
    Ok(Json(state.ipam.get_pool(&scope, id).await?))
}

pub async fn create_pool(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateIpPoolRequest>,
) -> Result<(StatusCode, Json<IpPool>), ApiError> {
    let pool = state.ipam.create_pool(&scope, &req).await?;
    Ok(created(pool))
}

pub async fn update_pool(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateIpPoolRequest>,
) -> Result<Json<IpPool>, ApiError> {
    Ok(Json(state.ipam.update_pool(&scope, id, &req).await?))
}

pub async fn delete_pool(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.ipam.delete_pool(&scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    #[serde(default = "default_available_limit")]
    pub limit: usize,
}

fn default_available_limit() -> usize {
    100
}

/// First `limit` free addresses, in ascending order
pub async fn available_ips(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AvailableQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let available = state.ipam.get_available_ips(&scope, id).await?;
    Ok(Json(available.take(query.limit.clamp(1, 4096)).collect()))
}

pub async fn pool_utilization(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PoolUtilization>, ApiError> {
    Ok(Json(state.ipam.get_pool_utilization(&scope, id).await?))
}

// ========== Allocations ==========

pub async fn list_allocations(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<IpAllocation>>, ApiError> {
    Ok(Json(state.ipam.list_allocations(&scope, id).await?))
}

pub async fn allocation_history(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<AllocationHistoryEntry>>, ApiError> {
    Ok(Json(state.ipam.allocation_history(&scope, id).await?))
}

pub async fn allocate_ip(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocateIpRequest>,
) -> Result<(StatusCode, Json<IpAllocation>), ApiError> {
    let allocation = state
        .ipam
        .allocate_ip(&scope, req.pool_id, &req.mac_address, &req.username)
        .await?;
    Ok(created(allocation))
}

pub async fn reserve_ip(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReserveIpRequest>,
) -> Result<(StatusCode, Json<IpAllocation>), ApiError> {
    Ok(created(state.ipam.reserve_ip(&scope, &req).await?))
}

pub async fn release_ip(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.ipam.release_ip(&scope, id).await?;
    Ok(MessageResponse::new(format!("allocation {} released", id)))
}

pub async fn user_allocations(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<IpAllocation>>, ApiError> {
    Ok(Json(state.ipam.find_active_by_username(&scope, &username).await?))
}
