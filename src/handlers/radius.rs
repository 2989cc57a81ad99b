use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::*;
use crate::services::RadiusSync;
use crate::AppState;
use super::{created, ApiError, MessageResponse};

pub async fn test_connection(State(state): State<Arc<AppState>>) -> Result<Json<ConnectionTest>, ApiError> {
    Ok(Json(state.radius.test_connection().await?))
}

// ========== Users ==========

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<RadiusUser>, ApiError> {
    Ok(Json(state.radius.get_user(&username).await?))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RadiusUserAttributes>,
) -> Result<(StatusCode, Json<RadiusUser>), ApiError> {
    state.radius.create_user(&req).await?;
    Ok(created(state.radius.get_user(&req.username).await?))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Json(mut req): Json<RadiusUserAttributes>,
) -> Result<Json<RadiusUser>, ApiError> {
    req.username = username;
    state.radius.update_user(&req).await?;
    Ok(Json(state.radius.get_user(&req.username).await?))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.radius.delete_user(&username).await? {
        return Err(crate::error::NetError::not_found("RADIUS user", &username).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn disable_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.radius.get_user(&username).await?;
    state.radius.set_user_disabled(&username, true).await?;
    Ok(MessageResponse::new(format!("{} disabled", username)))
}

pub async fn enable_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.radius.get_user(&username).await?;
    state.radius.set_user_disabled(&username, false).await?;
    Ok(MessageResponse::new(format!("{} enabled", username)))
}

/// Push every visible network user into RADIUS
pub async fn sync_all(
    scope: TenantScope,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RadiusSyncSummary>, ApiError> {
    let users = state.pppoe.list_network_users(&scope).await?;
    let rate_limits: HashMap<String, String> = state
        .pppoe
        .list_package_mappings(&scope)
        .await?
        .into_iter()
        .filter_map(|m| m.rate_limit.map(|rate| (m.profile_name, rate)))
        .collect();
    Ok(Json(state.radius.sync_all(&users, &rate_limits).await))
}

// ========== Authentication & Accounting ==========

pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthenticateRequest>,
) -> Result<Json<AuthResult>, ApiError> {
    Ok(Json(state.radius.authenticate(&req.username, &req.password).await?))
}

pub async fn accounting_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountingRequest>,
) -> Result<Json<AccountingRecord>, ApiError> {
    Ok(Json(state.radius.accounting_start(&req).await?))
}

pub async fn accounting_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountingRequest>,
) -> Result<Json<AccountingRecord>, ApiError> {
    Ok(Json(state.radius.accounting_update(&req).await?))
}

pub async fn accounting_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountingRequest>,
) -> Result<Json<AccountingRecord>, ApiError> {
    Ok(Json(state.radius.accounting_stop(&req).await?))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub username: Option<String>,
}

pub async fn active_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Vec<AccountingRecord>>, ApiError> {
    Ok(Json(state.radius.active_sessions(query.username.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<AccountingRecord>>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.radius.session_history(&username, limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// Usage over `[from, to)`; defaults to the last 30 days
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageSummary>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(30));
    Ok(Json(state.radius.usage(&username, from, to).await?))
}
