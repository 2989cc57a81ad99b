use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Network user provisioning states
pub mod network_user_state {
    pub const UNPROVISIONED: &str = "unprovisioned";
    pub const PROVISIONED: &str = "provisioned";
    pub const DEPROVISIONED: &str = "deprovisioned";
}

/// Access service types written into router comments
pub mod service_type {
    pub const PPPOE: &str = "pppoe";
    pub const HOTSPOT: &str = "hotspot";
}

/// Router connection descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub name: String,
    pub host: String,
    pub api_port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub vendor: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRouterRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub vendor: Option<String>,
}

fn default_api_port() -> u16 {
    8728
}

/// Mirror of the billing-side customer record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertCustomerRequest {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub package_id: Option<i64>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
}

/// (package, router) -> router-side profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageProfileMapping {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub package_id: i64,
    pub router_id: i64,
    pub profile_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_pool_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_control_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePackageMappingRequest {
    pub package_id: i64,
    pub router_id: i64,
    pub profile_name: String,
    #[serde(default)]
    pub ip_pool_id: Option<i64>,
    #[serde(default)]
    pub speed_control_method: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<String>,
}

/// A customer's PPPoE/hotspot access identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkUser {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub customer_id: i64,
    pub router_id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub profile: String,
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
    pub router_comment: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written to the local record once router and RADIUS agree
#[derive(Debug, Clone)]
pub struct ProvisionedUser {
    pub customer_id: i64,
    pub router_id: i64,
    pub username: String,
    pub password: String,
    pub profile: String,
    pub service_type: String,
    pub static_ip: Option<String>,
    pub allocation_id: Option<i64>,
    pub package_id: Option<i64>,
    pub expiry_date: Option<NaiveDate>,
    pub router_comment: String,
}

/// PPPoE secret payload pushed to a router
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PppoeUserAttributes {
    pub name: String,
    pub password: String,
    pub profile: String,
    pub service: String,
    pub remote_address: Option<String>,
    pub caller_id: Option<String>,
    pub comment: String,
    pub disabled: bool,
}

/// PPP profile payload pushed to a router
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PppProfileAttributes {
    pub name: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub rate_limit: Option<String>,
    pub session_timeout: Option<String>,
    pub only_one: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub customer_id: i64,
    pub router_id: i64,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub static_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeprovisionRequest {
    pub customer_id: i64,
    pub router_id: i64,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkProvisionRequest {
    pub router_id: i64,
    pub customer_ids: Vec<i64>,
}

/// Per-item outcome of a bulk operation
pub mod bulk_status {
    pub const SUCCEEDED: &str = "succeeded";
    pub const FAILED: &str = "failed";
    pub const SKIPPED: &str = "skipped";
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub customer_id: i64,
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A router secret whose comment does not resolve to a local user
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedSecret {
    pub secret_name: String,
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub router_id: i64,
    pub checked: usize,
    pub orphaned: Vec<OrphanedSecret>,
    pub missing: Vec<String>,
    pub state_mismatch: Vec<String>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty() && self.state_mismatch.is_empty()
    }
}
