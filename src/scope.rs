use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::handlers::ErrorResponse;
use crate::models::TenantScope;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Extracts the caller's tenant scope from `X-Tenant-Id`.
///
/// A missing header is the platform-wide scope.
#[async_trait::async_trait]
impl<S> FromRequestParts<S> for TenantScope
where
    S: Send + Sync,
{
    type Rejection = ScopeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(TENANT_HEADER) {
            None => Ok(TenantScope::platform()),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|id| *id > 0)
                .map(TenantScope::tenant)
                .ok_or(ScopeError::InvalidTenant),
        }
    }
}

#[derive(Debug)]
pub enum ScopeError {
    InvalidTenant,
}

impl IntoResponse for ScopeError {
    fn into_response(self) -> Response {
        let message = match self {
            ScopeError::InvalidTenant => "X-Tenant-Id must be a positive integer",
        };
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: message.to_string(),
                kind: Some("invalid_input"),
                step: None,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<TenantScope, ScopeError> {
        let mut builder = Request::builder().uri("/api/ipam/pools");
        if let Some(h) = header {
            builder = builder.header(TENANT_HEADER, h);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        TenantScope::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_scope_from_header() {
        assert_eq!(extract(None).await.unwrap(), TenantScope::platform());
        assert_eq!(extract(Some("12")).await.unwrap(), TenantScope::tenant(12));
        assert!(extract(Some("abc")).await.is_err());
        assert!(extract(Some("0")).await.is_err());
    }
}
