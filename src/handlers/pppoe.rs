use axum::{extract::State, Json};
use std::sync::Arc;

use crate::models::*;
use crate::AppState;
use super::ApiError;

pub async fn list_network_users(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NetworkUser>>, ApiError> {
    Ok(Json(state.pppoe.list_network_users(&scope).await?))
}

pub async fn provision(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<NetworkUser>, ApiError> {
    Ok(Json(state.pppoe.provision(&scope, &req).await?))
}

pub async fn deprovision(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeprovisionRequest>,
) -> Result<Json<NetworkUser>, ApiError> {
    Ok(Json(state.pppoe.deprovision(&scope, &req).await?))
}

/// Per-item results; only a failed router connection fails the whole call
pub async fn bulk_provision(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkProvisionRequest>,
) -> Result<Json<Vec<BulkItemResult>>, ApiError> {
    if req.customer_ids.is_empty() {
        return Err(ApiError::bad_request("customer_ids must not be empty"));
    }
    Ok(Json(state.pppoe.bulk_provision(&scope, &req).await?))
}
