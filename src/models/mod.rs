pub mod ipam;
pub mod monitoring;
pub mod network;
pub mod olt;
pub mod radius;

pub use ipam::*;
pub use monitoring::*;
pub use network::*;
pub use olt::*;
pub use radius::*;

use serde::{Deserialize, Serialize};

/// Visibility scope for every core call. `None` is the platform-wide scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: Option<i64>,
}

impl TenantScope {
    pub fn platform() -> Self {
        Self { tenant_id: None }
    }

    pub fn tenant(id: i64) -> Self {
        Self { tenant_id: Some(id) }
    }

    /// Whether a row owned by `owner` is visible in this scope
    pub fn allows(&self, owner: Option<i64>) -> bool {
        match self.tenant_id {
            None => true,
            Some(id) => owner == Some(id),
        }
    }
}

/// Canonical router/OLT reachability values
pub mod device_status {
    pub const ONLINE: &str = "online";
    pub const OFFLINE: &str = "offline";
    pub const UNKNOWN: &str = "unknown";
}
