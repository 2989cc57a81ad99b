//! Device protocol clients: RouterOS API, SNMP v2c and SSH CLI.

pub mod cli;
pub mod mikrotik;
pub mod routeros;
pub mod snmp;

pub use cli::{CliClient, SshCliClient};
pub use mikrotik::{
    ActiveSession, FirewallRule, FirewallRuleAttributes, PppProfile, PppSecret, RouterApi, RouterConnector,
    RouterOsConnector, SimpleQueue, SimpleQueueAttributes, SystemResource,
};
pub use snmp::{SnmpClient, SnmpValue, UdpSnmpClient};

use std::sync::Arc;
use std::time::Duration;

use crate::models::Olt;

/// Builds protocol clients for an OLT
pub trait OltConnector: Send + Sync {
    fn snmp(&self, olt: &Olt) -> Arc<dyn SnmpClient>;
    fn cli(&self, olt: &Olt) -> Arc<dyn CliClient>;
}

/// Connector for real OLTs
pub struct DefaultOltConnector {
    snmp_timeout: Duration,
    cli_timeout: Duration,
}

impl DefaultOltConnector {
    pub fn new(snmp_timeout: Duration, cli_timeout: Duration) -> Self {
        Self {
            snmp_timeout,
            cli_timeout,
        }
    }
}

impl OltConnector for DefaultOltConnector {
    fn snmp(&self, olt: &Olt) -> Arc<dyn SnmpClient> {
        Arc::new(UdpSnmpClient::new(
            &olt.ip_address,
            olt.snmp_port,
            &olt.snmp_community,
            self.snmp_timeout,
        ))
    }

    fn cli(&self, olt: &Olt) -> Arc<dyn CliClient> {
        Arc::new(SshCliClient::new(
            &olt.ip_address,
            olt.ssh_port,
            &olt.username,
            &olt.password,
            self.cli_timeout,
        ))
    }
}
