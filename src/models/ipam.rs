use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allocation lifecycle states
pub mod allocation_status {
    pub const RESERVED: &str = "reserved";
    pub const ACTIVE: &str = "active";
    pub const RELEASED: &str = "released";
}

/// Pool status values
pub mod pool_status {
    pub const ACTIVE: &str = "active";
    pub const INACTIVE: &str = "inactive";
}

/// Allocation history actions
pub mod allocation_action {
    pub const ALLOCATED: &str = "allocated";
    pub const RELEASED: &str = "released";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPool {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub name: String,
    pub cidr: String,
    pub network_int: i64,
    pub broadcast_int: i64,
    pub prefix_length: i32,
    pub range_start: String,
    pub range_end: String,
    pub range_start_int: i64,
    pub range_end_int: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_primary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_secondary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub allow_shared_mac: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_allocations: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpPool {
    pub fn is_active(&self) -> bool {
        self.status == pool_status::ACTIVE
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIpPoolRequest {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_primary: Option<String>,
    #[serde(default)]
    pub dns_secondary: Option<String>,
    #[serde(default)]
    pub range_start: Option<String>,
    #[serde(default)]
    pub range_end: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allow_shared_mac: bool,
}

/// Pools are immutable apart from their metadata
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateIpPoolRequest {
    pub name: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_primary: Option<String>,
    #[serde(default)]
    pub dns_secondary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub id: i64,
    pub pool_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub address: String,
    pub address_int: i64,
    pub mac_address: String,
    pub username: String,
    pub status: String,
    pub allocated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationHistoryEntry {
    pub id: i64,
    pub allocation_id: i64,
    pub pool_id: i64,
    pub address: String,
    pub mac_address: String,
    pub username: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocateIpRequest {
    pub pool_id: i64,
    pub mac_address: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveIpRequest {
    pub pool_id: i64,
    pub address: String,
    pub mac_address: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolUtilization {
    pub pool_id: i64,
    pub total: u64,
    pub allocated: u64,
    pub available: u64,
    pub utilization_percent: f64,
}
