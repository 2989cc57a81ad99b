use serde::Serialize;
use thiserror::Error;

/// Step of a provisioning flow, reported with every provisioning failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    Profile,
    Ip,
    Connect,
    RouterWrite,
    RadiusWrite,
    Persist,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Profile => "profile",
            ProvisionStep::Ip => "ip",
            ProvisionStep::Connect => "connect",
            ProvisionStep::RouterWrite => "router_write",
            ProvisionStep::RadiusWrite => "radius_write",
            ProvisionStep::Persist => "persist",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy of the network core. Callers never see vendor-specific errors.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pool {pool_id} exhausted")]
    PoolExhausted { pool_id: i64 },

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("device timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("device rejected command: {0}")]
    DeviceRejected(String),

    #[error("no profile mapping for package {package_id} on router {router_id}")]
    NoProfileMapping { package_id: i64, router_id: i64 },

    #[error("partial failure at {step}: {message}")]
    PartialFailure { step: String, message: String },

    #[error("reconciliation needed: {0}")]
    ReconciliationNeeded(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl NetError {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        NetError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        NetError::InvalidInput(msg.into())
    }

    /// Stable machine-readable code
    pub fn kind(&self) -> &'static str {
        match self {
            NetError::NotFound { .. } => "not_found",
            NetError::InvalidInput(_) => "invalid_input",
            NetError::PoolExhausted { .. } => "pool_exhausted",
            NetError::DeviceUnreachable(_) => "device_unreachable",
            NetError::Timeout { .. } => "device_unreachable",
            NetError::DeviceRejected(_) => "device_rejected",
            NetError::NoProfileMapping { .. } => "no_profile_mapping",
            NetError::PartialFailure { .. } => "partial_failure",
            NetError::ReconciliationNeeded(_) => "reconciliation_needed",
            NetError::Storage(_) => "storage",
        }
    }

    /// True for connect/timeout failures
    pub fn is_unreachable(&self) -> bool {
        matches!(self, NetError::DeviceUnreachable(_) | NetError::Timeout { .. })
    }
}

impl From<anyhow::Error> for NetError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(nf) = err.downcast_ref::<crate::db::NotFoundError>() {
            return NetError::not_found(&nf.resource, &nf.id);
        }
        NetError::Storage(format!("{:#}", err))
    }
}

impl From<sqlx::Error> for NetError {
    fn from(err: sqlx::Error) -> Self {
        NetError::Storage(err.to_string())
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// A provisioning failure tagged with the step that failed
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct ProvisionError {
    pub step: ProvisionStep,
    #[source]
    pub source: NetError,
}

impl ProvisionError {
    pub fn at(step: ProvisionStep) -> impl FnOnce(NetError) -> ProvisionError {
        move |source| ProvisionError { step, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_downcast_from_anyhow() {
        let err: anyhow::Error = crate::db::NotFoundError::new("Pool", "7").into();
        let net: NetError = err.into();
        assert_eq!(net.kind(), "not_found");
        assert_eq!(net.to_string(), "Pool not found: 7");
    }

    #[test]
    fn test_timeout_counts_as_unreachable() {
        let err = NetError::Timeout { operation: "connect".into(), secs: 5 };
        assert!(err.is_unreachable());
        assert_eq!(err.kind(), "device_unreachable");
    }

    #[test]
    fn test_provision_error_names_step() {
        let err = ProvisionError::at(ProvisionStep::RouterWrite)(NetError::DeviceRejected("failure: bad profile".into()));
        assert_eq!(err.to_string(), "router_write failed: device rejected command: failure: bad profile");
    }
}
