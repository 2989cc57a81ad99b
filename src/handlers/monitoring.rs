use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::models::*;
use crate::AppState;
use super::{ApiError, MessageResponse};

pub async fn device_statuses(State(state): State<Arc<AppState>>) -> Result<Json<DeviceStatusSummary>, ApiError> {
    Ok(Json(state.monitoring.device_statuses().await?))
}

pub async fn get_monitor(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Json<DeviceMonitor>, ApiError> {
    Ok(Json(state.monitoring.get_monitor(&kind, id).await?))
}

/// Poll one device now instead of waiting for the next monitoring pass
pub async fn monitor_device(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Json<DeviceMonitor>, ApiError> {
    Ok(Json(state.monitoring.monitor_device(&kind, id).await?))
}

pub async fn record_bandwidth(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordBandwidthRequest>,
) -> Result<StatusCode, ApiError> {
    state.monitoring.record_bandwidth(&req).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn bandwidth_usage(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
    Query(query): Query<BandwidthQuery>,
) -> Result<Json<BandwidthReport>, ApiError> {
    Ok(Json(state.monitoring.bandwidth_usage(&kind, id, &query).await?))
}

pub async fn aggregate_bandwidth(State(state): State<Arc<AppState>>) -> Result<Json<MessageResponse>, ApiError> {
    let now = chrono::Utc::now();
    let hourly = state.monitoring.aggregate_hourly(now).await?;
    let daily = state.monitoring.aggregate_daily(now).await?;
    Ok(MessageResponse::new(format!(
        "aggregated {} hourly and {} daily buckets",
        hourly, daily
    )))
}
