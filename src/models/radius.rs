use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RADIUS attribute names used by the sync layer
pub mod radius_attr {
    pub const CLEARTEXT_PASSWORD: &str = "Cleartext-Password";
    pub const AUTH_TYPE: &str = "Auth-Type";
    pub const FRAMED_IP_ADDRESS: &str = "Framed-IP-Address";
    pub const MIKROTIK_RATE_LIMIT: &str = "Mikrotik-Rate-Limit";
    pub const MIKROTIK_GROUP: &str = "Mikrotik-Group";
    pub const SESSION_TIMEOUT: &str = "Session-Timeout";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadiusAttribute {
    pub attribute: String,
    pub op: String,
    pub value: String,
}

/// Credential and reply attributes mirrored for one user
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RadiusUserAttributes {
    pub username: String,
    pub password: String,
    pub profile: Option<String>,
    pub framed_ip: Option<String>,
    pub rate_limit: Option<String>,
    pub session_timeout: Option<u64>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RadiusUser {
    pub username: String,
    pub check: Vec<RadiusAttribute>,
    pub reply: Vec<RadiusAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticateRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reply: Vec<RadiusAttribute>,
}

/// Accounting packet as forwarded by the RADIUS-facing endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountingRequest {
    pub acct_session_id: String,
    pub username: String,
    #[serde(default)]
    pub nas_ip_address: String,
    #[serde(default)]
    pub nas_port_id: Option<String>,
    #[serde(default)]
    pub framed_ip_address: String,
    #[serde(default)]
    pub calling_station_id: String,
    #[serde(default)]
    pub session_time: i64,
    #[serde(default)]
    pub input_octets: i64,
    #[serde(default)]
    pub output_octets: i64,
    #[serde(default)]
    pub terminate_cause: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountingRecord {
    pub id: i64,
    pub acct_session_id: String,
    pub username: String,
    pub nas_ip_address: String,
    pub framed_ip_address: String,
    pub calling_station_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    pub session_time: i64,
    pub input_octets: i64,
    pub output_octets: i64,
    pub terminate_cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub username: String,
    pub sessions: i64,
    pub session_time: i64,
    pub input_octets: i64,
    pub output_octets: i64,
    pub total_octets: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RadiusSyncSummary {
    pub synced: usize,
    pub disabled: usize,
    pub failed: Vec<String>,
}
