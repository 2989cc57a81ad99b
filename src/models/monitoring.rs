use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monitored device kinds
pub mod device_kind {
    pub const ROUTER: &str = "router";
    pub const OLT: &str = "olt";
    pub const ONU: &str = "onu";

    pub const ALL: &[&str] = &[ROUTER, OLT, ONU];
}

/// Monitor status values
pub mod monitor_status {
    pub const ONLINE: &str = "online";
    pub const DEGRADED: &str = "degraded";
    pub const UNREACHABLE: &str = "unreachable";
    pub const UNKNOWN: &str = "unknown";
}

/// Bandwidth bucket granularity
pub mod period_type {
    pub const RAW: &str = "raw";
    pub const HOURLY: &str = "hourly";
    pub const DAILY: &str = "daily";
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceMonitor {
    pub id: i64,
    pub device_type: String,
    pub device_id: i64,
    pub status: String,
    pub consecutive_failures: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_check_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordBandwidthRequest {
    pub device_type: String,
    pub device_id: i64,
    pub upload_bytes: i64,
    pub download_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthPoint {
    pub period_start: DateTime<Utc>,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub total_bytes: i64,
    pub samples: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthReport {
    pub device_type: String,
    pub device_id: i64,
    pub period_type: String,
    pub points: Vec<BandwidthPoint>,
    pub total_upload: i64,
    pub total_download: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatusSummary {
    pub total: usize,
    pub online: usize,
    pub degraded: usize,
    pub unreachable: usize,
    pub unknown: usize,
    pub devices: Vec<DeviceMonitor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BandwidthQuery {
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

fn default_period() -> String {
    period_type::HOURLY.to_string()
}
