use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::*;
use crate::protocols::{
    ActiveSession, FirewallRule, FirewallRuleAttributes, PppProfile, PppSecret, SimpleQueue, SimpleQueueAttributes,
    SystemResource,
};
use crate::AppState;
use super::{created, ApiError, MessageResponse};

#[derive(Debug, serde::Serialize)]
pub struct CreatedId {
    pub id: String,
}

// ========== Router Descriptors ==========

pub async fn list_routers(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Router>>, ApiError> {
    Ok(Json(state.pppoe.list_routers(&scope).await?))
}

pub async fn get_router(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Router>, ApiError> {
    Ok(Json(state.pppoe.get_router(&scope, id).await?))
}

pub async fn create_router(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRouterRequest>,
) -> Result<(StatusCode, Json<Router>), ApiError> {
    Ok(created(state.pppoe.create_router(&scope, &req).await?))
}

pub async fn delete_router(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.pppoe.delete_router(&scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== Live Router Operations ==========

pub async fn test_router(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionTest>, ApiError> {
    Ok(Json(state.pppoe.test_router(&scope, id).await?))
}

pub async fn system_resource(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SystemResource>, ApiError> {
    Ok(Json(state.pppoe.system_resource(&scope, id).await?))
}

pub async fn list_secrets(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PppSecret>>, ApiError> {
    Ok(Json(state.pppoe.list_secrets(&scope, id).await?))
}

pub async fn active_sessions(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<ActiveSession>>, ApiError> {
    Ok(Json(state.pppoe.active_sessions(&scope, id).await?))
}

pub async fn disconnect_session(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path((id, session_id)): Path<(i64, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.pppoe.disconnect_session(&scope, id, &session_id).await?;
    Ok(MessageResponse::new("session disconnected"))
}

pub async fn list_profiles(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PppProfile>>, ApiError> {
    Ok(Json(state.pppoe.list_profiles(&scope, id).await?))
}

pub async fn ensure_profile(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PppProfileAttributes>,
) -> Result<Json<PppProfile>, ApiError> {
    Ok(Json(state.pppoe.ensure_profile(&scope, id, &req).await?))
}

pub async fn list_queues(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<SimpleQueue>>, ApiError> {
    Ok(Json(state.pppoe.list_queues(&scope, id).await?))
}

pub async fn add_queue(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SimpleQueueAttributes>,
) -> Result<(StatusCode, Json<CreatedId>), ApiError> {
    let id = state.pppoe.add_queue(&scope, id, &req).await?;
    Ok(created(CreatedId { id }))
}

#[derive(Debug, Deserialize)]
pub struct FirewallQuery {
    #[serde(default)]
    pub chain: Option<String>,
}

pub async fn list_firewall_rules(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<FirewallQuery>,
) -> Result<Json<Vec<FirewallRule>>, ApiError> {
    Ok(Json(
        state
            .pppoe
            .list_firewall_rules(&scope, id, query.chain.as_deref())
            .await?,
    ))
}

pub async fn add_firewall_rule(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FirewallRuleAttributes>,
) -> Result<(StatusCode, Json<CreatedId>), ApiError> {
    let id = state.pppoe.add_firewall_rule(&scope, id, &req).await?;
    Ok(created(CreatedId { id }))
}

pub async fn reconcile_router(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    Ok(Json(state.pppoe.reconcile_router(&scope, id).await?))
}

// ========== Customers & Package Mappings ==========

pub async fn list_customers(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Customer>>, ApiError> {
    Ok(Json(state.pppoe.list_customers(&scope).await?))
}

pub async fn upsert_customer(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertCustomerRequest>,
) -> Result<Json<Customer>, ApiError> {
    Ok(Json(state.pppoe.upsert_customer(&scope, &req).await?))
}

pub async fn list_package_mappings(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PackageProfileMapping>>, ApiError> {
    Ok(Json(state.pppoe.list_package_mappings(&scope).await?))
}

pub async fn create_package_mapping(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePackageMappingRequest>,
) -> Result<(StatusCode, Json<PackageProfileMapping>), ApiError> {
    Ok(created(state.pppoe.create_package_mapping(&scope, &req).await?))
}

pub async fn delete_package_mapping(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.pppoe.delete_package_mapping(&scope, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
