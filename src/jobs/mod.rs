//! Background jobs: scheduled OLT sync, device monitoring, bandwidth roll-ups.
//!
//! Every loop logs its failures and keeps going.

use chrono::{DateTime, Utc};
use croner::Cron;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Store;
use crate::models::TenantScope;
use crate::services::{MonitoringService, OltService};

/// Parse an OLT sync schedule; six-field (seconds) and five-field forms are accepted
pub fn parse_schedule(expr: &str) -> anyhow::Result<Cron> {
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cron expression {:?}: {}", expr, e))
}

/// Next run strictly after `after`
pub fn next_run(cron: &Cron, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(after, false).ok()
}

pub struct Scheduler {
    store: Store,
    olts: OltService,
    monitoring: MonitoringService,
}

impl Scheduler {
    pub fn new(store: Store, olts: OltService, monitoring: MonitoringService) -> Arc<Self> {
        Arc::new(Self {
            store,
            olts,
            monitoring,
        })
    }

    /// Spawn all loops. An invalid sync schedule disables only the sync loop.
    pub fn start(self: &Arc<Self>, sync_schedule: &str, monitor_interval: Duration, aggregate_interval: Duration) {
        match parse_schedule(sync_schedule) {
            Ok(cron) => {
                let svc = self.clone();
                tokio::spawn(async move { svc.olt_sync_loop(cron).await });
            }
            Err(e) => tracing::error!("OLT sync disabled: {}", e),
        }

        let svc = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor_interval);
            loop {
                ticker.tick().await;
                match svc.monitoring.monitor_all().await {
                    Ok(count) => tracing::debug!("Monitoring pass polled {} devices", count),
                    Err(e) => tracing::error!("Monitoring pass failed: {}", e),
                }
            }
        });

        let svc = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregate_interval);
            loop {
                ticker.tick().await;
                svc.run_aggregation(Utc::now()).await;
            }
        });
    }

    async fn olt_sync_loop(&self, cron: Cron) {
        loop {
            let now = Utc::now();
            let Some(next) = next_run(&cron, &now) else {
                tracing::error!("OLT sync schedule has no future occurrence; stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            let synced = self.sync_all_olts().await;
            tracing::info!("Scheduled OLT sync finished ({} OLTs synced)", synced);
        }
    }

    /// Sync every registered OLT; returns how many succeeded
    pub async fn sync_all_olts(&self) -> usize {
        let scope = TenantScope::platform();
        let olts = match self.store.list_olts(&scope).await {
            Ok(olts) => olts,
            Err(e) => {
                tracing::error!("Scheduler: failed to list OLTs: {}", e);
                return 0;
            }
        };

        let mut synced = 0;
        for olt in &olts {
            match self.olts.sync_onus(&scope, olt.id).await {
                Ok(result) => {
                    synced += 1;
                    if !result.failed_ports.is_empty() {
                        tracing::warn!("OLT {}: {} ports unreadable during sync", olt.name, result.failed_ports.len());
                    }
                }
                Err(e) => tracing::warn!("Scheduled sync of OLT {} failed: {}", olt.name, e),
            }
        }
        synced
    }

    pub async fn run_aggregation(&self, now: DateTime<Utc>) {
        if let Err(e) = self.monitoring.aggregate_hourly(now).await {
            tracing::error!("Hourly bandwidth aggregation failed: {}", e);
        }
        if let Err(e) = self.monitoring.aggregate_daily(now).await {
            tracing::error!("Daily bandwidth aggregation failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_default_schedule_every_quarter_hour() {
        let cron = parse_schedule("0 */15 * * * *").unwrap();
        assert_eq!(next_run(&cron, &at("2026-05-01T10:07:30Z")), Some(at("2026-05-01T10:15:00Z")));
        assert_eq!(next_run(&cron, &at("2026-05-01T10:15:00Z")), Some(at("2026-05-01T10:30:00Z")));
    }

    #[test]
    fn test_five_field_schedule_accepted() {
        let cron = parse_schedule("30 2 * * *").unwrap();
        assert_eq!(next_run(&cron, &at("2026-05-01T10:00:00Z")), Some(at("2026-05-02T02:30:00Z")));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        assert!(parse_schedule("every now and then").is_err());
    }
}
