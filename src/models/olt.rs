use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ONU link status values
pub mod onu_status {
    pub const ONLINE: &str = "online";
    pub const OFFLINE: &str = "offline";
    pub const UNKNOWN: &str = "unknown";
}

/// ONU operation state machine
pub mod onu_auth_state {
    pub const DISCOVERED: &str = "discovered";
    pub const AUTHORIZED: &str = "authorized";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const PENDING_RECHECK: &str = "pending_recheck";
}

/// OLT management transports
pub mod management_protocol {
    pub const SNMP: &str = "snmp";
    pub const SSH: &str = "ssh";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Olt {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub name: String,
    pub ip_address: String,
    pub brand: String,
    pub model: String,
    pub vendor: String,
    pub management_protocol: String,
    pub ssh_port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub snmp_community: String,
    pub snmp_port: u16,
    pub pon_port_count: i64,
    pub max_onus: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOltRequest {
    pub name: String,
    pub ip_address: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub management_protocol: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub snmp_community: Option<String>,
    #[serde(default)]
    pub snmp_port: Option<u16>,
    #[serde(default)]
    pub pon_port_count: Option<i64>,
    #[serde(default)]
    pub max_onus: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Onu {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    pub olt_id: i64,
    pub serial_number: String,
    pub pon_port: String,
    pub onu_id: i64,
    pub status: String,
    pub auth_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_rx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ONU as reported by a device poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredOnu {
    pub serial_number: String,
    pub pon_port: String,
    pub onu_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_rx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortFailure {
    pub pon_port: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryResult {
    pub onus: Vec<DiscoveredOnu>,
    pub failed_ports: Vec<PortFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub touched: usize,
    pub created: usize,
    pub updated: usize,
    pub marked_offline: usize,
    pub failed_ports: Vec<PortFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnuStatusSnapshot {
    pub onu_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_rx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Best-effort device health gauges
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub uptime_seconds: Option<i64>,
    pub temperature: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OltStatistics {
    pub olt_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    pub total_onus: i64,
    pub online_onus: i64,
    pub offline_onus: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OltBackup {
    pub id: i64,
    pub olt_id: i64,
    pub filename: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigApplyResult {
    pub olt_id: i64,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnuCommandResult {
    pub onu_id: i64,
    pub auth_state: String,
    pub confirmed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyConfigRequest {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkOnuRequest {
    #[serde(default)]
    pub network_user_id: Option<i64>,
}
