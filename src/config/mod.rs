use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub db_max_connections: u32,
    pub radius_db_path: String,
    pub listen_addr: String,
    pub backup_dir: PathBuf,
    pub router_timeout: Duration,
    pub olt_timeout: Duration,
    pub snmp_timeout: Duration,
    pub bulk_item_timeout: Duration,
    pub bulk_batch_timeout: Duration,
    pub failure_threshold: i64,
    pub onu_confirm_delay: Duration,
    pub olt_sync_schedule: String,
    pub monitor_interval: Duration,
    pub aggregate_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            db_path: get_env("DB_PATH", "/data/netcore.db"),
            db_max_connections: get_parsed("DB_MAX_CONNECTIONS", 5),
            radius_db_path: get_env("RADIUS_DB_PATH", "/data/radius.db"),
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            backup_dir: PathBuf::from(get_env("BACKUP_DIR", "/backups")),
            router_timeout: Duration::from_secs(get_parsed("ROUTER_TIMEOUT_SECS", 5)),
            olt_timeout: Duration::from_secs(get_parsed("OLT_TIMEOUT_SECS", 10)),
            snmp_timeout: Duration::from_secs(get_parsed("SNMP_TIMEOUT_SECS", 3)),
            bulk_item_timeout: Duration::from_secs(get_parsed("BULK_ITEM_TIMEOUT_SECS", 20)),
            bulk_batch_timeout: Duration::from_secs(get_parsed("BULK_BATCH_TIMEOUT_SECS", 300)),
            failure_threshold: get_parsed("FAILURE_THRESHOLD", 3),
            onu_confirm_delay: Duration::from_millis(get_parsed("ONU_CONFIRM_DELAY_MS", 2000)),
            olt_sync_schedule: get_env("OLT_SYNC_SCHEDULE", "0 */15 * * * *"),
            monitor_interval: Duration::from_secs(get_parsed("MONITOR_INTERVAL_SECS", 300)),
            aggregate_interval: Duration::from_secs(get_parsed("AGGREGATE_INTERVAL_SECS", 3600)),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Numeric setting; unparseable values fall back to the default with a warning
fn get_parsed<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_parsed_falls_back() {
        env::set_var("NETCORE_TEST_PARSED_BAD", "many");
        env::set_var("NETCORE_TEST_PARSED_GOOD", " 42 ");
        assert_eq!(get_parsed("NETCORE_TEST_PARSED_BAD", 7u64), 7);
        assert_eq!(get_parsed("NETCORE_TEST_PARSED_GOOD", 7u64), 42);
        assert_eq!(get_parsed("NETCORE_TEST_PARSED_MISSING", 3i64), 3);
    }
}
