pub mod ipam;
pub mod monitoring;
pub mod olts;
pub mod pppoe;
pub mod radius;
pub mod routers;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{NetError, ProvisionError};
use crate::AppState;

/// Error response body: `{"error": .., "kind": .., "step": ..}`
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<&'static str>,
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<&'static str>,
    step: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            kind: Some("invalid_input"),
            step: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
            kind: None,
            step: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &NetError) -> StatusCode {
    match err {
        NetError::NotFound { .. } => StatusCode::NOT_FOUND,
        NetError::InvalidInput(_) | NetError::NoProfileMapping { .. } => StatusCode::BAD_REQUEST,
        NetError::PoolExhausted { .. } | NetError::ReconciliationNeeded(_) => StatusCode::CONFLICT,
        NetError::DeviceUnreachable(_) | NetError::DeviceRejected(_) => StatusCode::BAD_GATEWAY,
        NetError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        NetError::PartialFailure { .. } => StatusCode::MULTI_STATUS,
        NetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<NetError> for ApiError {
    fn from(err: NetError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", err);
        }
        Self {
            status,
            kind: Some(err.kind()),
            message: err.to_string(),
            step: None,
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let step = err.step.as_str();
        let mut api = ApiError::from(err.source);
        api.step = Some(step);
        api
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::from(NetError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                kind: self.kind,
                step: self.step,
            }),
        )
            .into_response()
    }
}

/// Message response for simple status messages
#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(msg: impl Into<String>) -> Json<Self> {
        Json(Self { message: msg.into() })
    }
}

/// Response helper: return 201 Created with JSON body
pub fn created<T: Serialize>(item: T) -> (StatusCode, Json<T>) {
    (StatusCode::CREATED, Json(item))
}

/// Healthcheck endpoint: 200 with per-database status, 503 when the main database is down
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database = state.store.ping().await.is_ok();
    let radius = state.radius.test_connection().await.map(|t| t.success).unwrap_or(false);
    let status = if database { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if database { "ok" } else { "degraded" },
            "service": "netcore",
            "database": database,
            "radius": radius,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionStep;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (NetError::not_found("Pool", 1), StatusCode::NOT_FOUND),
            (NetError::invalid("bad"), StatusCode::BAD_REQUEST),
            (NetError::PoolExhausted { pool_id: 1 }, StatusCode::CONFLICT),
            (NetError::DeviceUnreachable("down".into()), StatusCode::BAD_GATEWAY),
            (
                NetError::Timeout {
                    operation: "connect".into(),
                    secs: 5,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                NetError::NoProfileMapping {
                    package_id: 1,
                    router_id: 2,
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_provision_error_carries_step() {
        let err = ProvisionError {
            step: ProvisionStep::RadiusWrite,
            source: NetError::PartialFailure {
                step: "radius_write".into(),
                message: "radius down".into(),
            },
        };
        let api = ApiError::from(err);
        assert_eq!(api.status(), StatusCode::MULTI_STATUS);
        assert_eq!(api.step, Some("radius_write"));
        assert_eq!(api.kind, Some("partial_failure"));
    }
}
