//! Device health monitoring and bandwidth accounting.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::olt::OltService;
use super::pppoe::PppoeService;
use crate::db::{BandwidthRow, Store};
use crate::error::{NetError, NetResult};
use crate::models::*;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86_400;

/// One health read of one device
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, kind: &str, device_id: i64) -> NetResult<DeviceHealth>;
}

/// Probes real devices: routers via system resource, OLTs via SNMP/CLI, ONUs via their OLT
pub struct DeviceProbes {
    pppoe: PppoeService,
    olts: OltService,
}

impl DeviceProbes {
    pub fn new(pppoe: PppoeService, olts: OltService) -> Self {
        Self { pppoe, olts }
    }
}

#[async_trait]
impl HealthProbe for DeviceProbes {
    async fn probe(&self, kind: &str, device_id: i64) -> NetResult<DeviceHealth> {
        let scope = TenantScope::platform();
        match kind {
            device_kind::ROUTER => Ok(self.pppoe.system_resource(&scope, device_id).await?.health()),
            device_kind::OLT => {
                let olt = self.olts.get_olt(&scope, device_id).await?;
                self.olts.poll_health(&olt).await
            }
            device_kind::ONU => {
                let onu = self.olts.refresh_onu_status(&scope, device_id).await?;
                if onu.status == onu_status::ONLINE {
                    Ok(DeviceHealth::default())
                } else {
                    Err(NetError::DeviceUnreachable(format!("ONU {} is {}", onu.serial_number, onu.status)))
                }
            }
            other => Err(NetError::invalid(format!("unknown device type {:?}", other))),
        }
    }
}

fn validate_kind(kind: &str) -> NetResult<()> {
    if device_kind::ALL.contains(&kind) {
        Ok(())
    } else {
        Err(NetError::invalid(format!("unknown device type {:?}", kind)))
    }
}

/// Start of the `secs`-wide bucket containing `at`
fn bucket_start(at: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    let ts = at.timestamp();
    Utc.timestamp_opt(ts - ts.rem_euclid(secs), 0).single().unwrap_or(at)
}

#[derive(Clone)]
pub struct MonitoringService {
    store: Store,
    probe: Arc<dyn HealthProbe>,
    failure_threshold: i64,
}

impl MonitoringService {
    pub fn new(store: Store, probe: Arc<dyn HealthProbe>, failure_threshold: i64) -> Self {
        Self {
            store,
            probe,
            failure_threshold: failure_threshold.max(1),
        }
    }

    // ========== Health ==========

    /// Poll one device and fold the outcome into its monitor row.
    /// The device only turns unreachable after enough consecutive failures.
    pub async fn monitor_device(&self, kind: &str, device_id: i64) -> NetResult<DeviceMonitor> {
        validate_kind(kind)?;
        match self.probe.probe(kind, device_id).await {
            Ok(health) => {
                let monitor = self
                    .store
                    .record_monitor_success(kind, device_id, monitor_status::ONLINE, &health)
                    .await?;
                self.set_device_status(kind, device_id, device_status::ONLINE).await?;
                Ok(monitor)
            }
            Err(e @ NetError::NotFound { .. }) | Err(e @ NetError::InvalidInput(_)) => Err(e),
            Err(e) => {
                let monitor = self
                    .store
                    .record_monitor_failure(kind, device_id, &e.to_string(), self.failure_threshold)
                    .await?;
                if monitor.status == monitor_status::UNREACHABLE {
                    tracing::warn!(
                        "{} {} unreachable after {} consecutive failures: {}",
                        kind,
                        device_id,
                        monitor.consecutive_failures,
                        e
                    );
                    self.set_device_status(kind, device_id, device_status::OFFLINE).await?;
                }
                Ok(monitor)
            }
        }
    }

    async fn set_device_status(&self, kind: &str, device_id: i64, status: &str) -> NetResult<()> {
        match kind {
            device_kind::ROUTER => self.store.update_router_status(device_id, status).await?,
            device_kind::OLT => self.store.update_olt_status(device_id, status).await?,
            _ => {}
        }
        Ok(())
    }

    /// Last recorded monitor state without polling the device
    pub async fn get_monitor(&self, kind: &str, device_id: i64) -> NetResult<DeviceMonitor> {
        validate_kind(kind)?;
        self.store
            .get_monitor(kind, device_id)
            .await?
            .ok_or_else(|| NetError::not_found("device monitor", format!("{}/{}", kind, device_id)))
    }

    /// Poll every registered router and OLT; per-device failures are logged
    pub async fn monitor_all(&self) -> NetResult<usize> {
        let scope = TenantScope::platform();
        let mut targets: Vec<(&str, i64)> = Vec::new();
        targets.extend(self.store.list_routers(&scope).await?.iter().map(|r| (device_kind::ROUTER, r.id)));
        targets.extend(self.store.list_olts(&scope).await?.iter().map(|o| (device_kind::OLT, o.id)));

        let mut polled = 0;
        for (kind, id) in targets {
            match self.monitor_device(kind, id).await {
                Ok(_) => polled += 1,
                Err(e) => tracing::warn!("Monitoring {} {} failed: {}", kind, id, e),
            }
        }
        Ok(polled)
    }

    pub async fn device_statuses(&self) -> NetResult<DeviceStatusSummary> {
        let devices = self.store.list_monitors().await?;
        let mut summary = DeviceStatusSummary {
            total: devices.len(),
            ..Default::default()
        };
        for d in &devices {
            match d.status.as_str() {
                monitor_status::ONLINE => summary.online += 1,
                monitor_status::DEGRADED => summary.degraded += 1,
                monitor_status::UNREACHABLE => summary.unreachable += 1,
                _ => summary.unknown += 1,
            }
        }
        summary.devices = devices;
        Ok(summary)
    }

    // ========== Bandwidth ==========

    pub async fn record_bandwidth(&self, req: &RecordBandwidthRequest) -> NetResult<()> {
        self.record_bandwidth_at(req, Utc::now()).await
    }

    pub async fn record_bandwidth_at(&self, req: &RecordBandwidthRequest, at: DateTime<Utc>) -> NetResult<()> {
        validate_kind(&req.device_type)?;
        if req.upload_bytes < 0 || req.download_bytes < 0 {
            return Err(NetError::invalid("byte counts must not be negative"));
        }
        self.store
            .insert_bandwidth(
                &req.device_type,
                req.device_id,
                period_type::RAW,
                at,
                req.upload_bytes,
                req.download_bytes,
                1,
            )
            .await?;
        Ok(())
    }

    /// Roll raw samples older than the current hour into hourly buckets
    pub async fn aggregate_hourly(&self, now: DateTime<Utc>) -> NetResult<usize> {
        self.roll_up(period_type::RAW, period_type::HOURLY, HOUR_SECS, now).await
    }

    /// Roll hourly buckets older than the current day into daily buckets
    pub async fn aggregate_daily(&self, now: DateTime<Utc>) -> NetResult<usize> {
        self.roll_up(period_type::HOURLY, period_type::DAILY, DAY_SECS, now).await
    }

    /// Merge closed `from` rows into `to` buckets. Sources are deleted with each
    /// merge, so rerunning only picks up rows recorded since.
    async fn roll_up(&self, from: &str, to: &str, width: i64, now: DateTime<Utc>) -> NetResult<usize> {
        let cutoff = bucket_start(now, width);
        let rows = self.store.bandwidth_rows_before(from, cutoff).await?;

        let mut buckets: BTreeMap<(String, i64, DateTime<Utc>), Vec<BandwidthRow>> = BTreeMap::new();
        for row in rows {
            let key = (row.device_type.clone(), row.device_id, bucket_start(row.period_start, width));
            buckets.entry(key).or_default().push(row);
        }

        let count = buckets.len();
        for ((device_type, device_id, start), sources) in buckets {
            self.store
                .merge_bandwidth_bucket(&device_type, device_id, to, start, &sources)
                .await?;
        }
        if count > 0 {
            tracing::info!("Aggregated {} {} buckets from {} rows", count, to, from);
        }
        Ok(count)
    }

    pub async fn bandwidth_usage(&self, kind: &str, device_id: i64, query: &BandwidthQuery) -> NetResult<BandwidthReport> {
        validate_kind(kind)?;
        let lookback = match query.period.as_str() {
            period_type::RAW | period_type::HOURLY => ChronoDuration::hours(24),
            period_type::DAILY => ChronoDuration::days(30),
            other => return Err(NetError::invalid(format!("unknown period {:?}", other))),
        };
        let to = query.to.unwrap_or_else(Utc::now);
        let from = query.from.unwrap_or(to - lookback);
        if from >= to {
            return Err(NetError::invalid("`from` must be before `to`"));
        }

        let points = self
            .store
            .bandwidth_points(kind, device_id, &query.period, from, to)
            .await?;
        let total_upload = points.iter().map(|p| p.upload_bytes).sum();
        let total_download = points.iter().map(|p| p.download_bytes).sum();
        Ok(BandwidthReport {
            device_type: kind.to_string(),
            device_id,
            period_type: query.period.clone(),
            total: total_upload + total_download,
            total_upload,
            total_download,
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_store;
    use std::sync::Mutex;

    /// Answers from a queue; an empty queue means healthy
    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<Vec<NetResult<DeviceHealth>>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _kind: &str, _device_id: i64) -> NetResult<DeviceHealth> {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Ok(DeviceHealth::default());
            }
            outcomes.remove(0)
        }
    }

    fn down() -> NetResult<DeviceHealth> {
        Err(NetError::DeviceUnreachable("connection refused".into()))
    }

    async fn service(outcomes: Vec<NetResult<DeviceHealth>>) -> (Store, MonitoringService) {
        let store = memory_store().await;
        let probe = Arc::new(ScriptedProbe {
            outcomes: Mutex::new(outcomes),
        });
        let svc = MonitoringService::new(store.clone(), probe, 3);
        (store, svc)
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample(up: i64, down: i64) -> RecordBandwidthRequest {
        RecordBandwidthRequest {
            device_type: "router".into(),
            device_id: 1,
            upload_bytes: up,
            download_bytes: down,
        }
    }

    #[tokio::test]
    async fn test_unreachable_only_after_threshold() {
        let health = DeviceHealth {
            cpu_usage: Some(12.0),
            ..Default::default()
        };
        let (_, svc) = service(vec![Ok(health), down(), down(), down(), Ok(DeviceHealth::default())]).await;

        let m = svc.monitor_device("olt", 7).await.unwrap();
        assert_eq!(m.status, "online");
        assert_eq!(m.cpu_usage, Some(12.0));

        let m = svc.monitor_device("olt", 7).await.unwrap();
        assert_eq!(m.status, "degraded");
        assert_eq!(m.consecutive_failures, 1);
        let m = svc.monitor_device("olt", 7).await.unwrap();
        assert_eq!(m.status, "degraded");
        let m = svc.monitor_device("olt", 7).await.unwrap();
        assert_eq!(m.status, "unreachable");
        assert_eq!(m.consecutive_failures, 3);

        let m = svc.monitor_device("olt", 7).await.unwrap();
        assert_eq!(m.status, "online");
        assert_eq!(m.consecutive_failures, 0);

        assert_eq!(svc.get_monitor("olt", 7).await.unwrap().status, "online");
        assert_eq!(svc.get_monitor("olt", 8).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_monitor_all_polls_routers_and_olts() {
        let (store, svc) = service(vec![down()]).await;
        let router = store
            .create_router(
                None,
                &CreateRouterRequest {
                    name: "core".into(),
                    host: "10.0.0.1".into(),
                    api_port: 8728,
                    username: "admin".into(),
                    password: "secret".into(),
                    vendor: None,
                },
            )
            .await
            .unwrap();
        let olt = store
            .create_olt(
                None,
                &CreateOltRequest {
                    name: "olt-1".into(),
                    ip_address: "10.10.0.2".into(),
                    brand: "VSOL".into(),
                    model: String::new(),
                    management_protocol: None,
                    ssh_port: None,
                    username: "admin".into(),
                    password: "admin".into(),
                    snmp_community: None,
                    snmp_port: None,
                    pon_port_count: None,
                    max_onus: None,
                },
                "vsol",
            )
            .await
            .unwrap();

        assert_eq!(svc.monitor_all().await.unwrap(), 2);
        assert_eq!(svc.get_monitor("router", router.id).await.unwrap().status, "degraded");
        assert_eq!(svc.get_monitor("olt", olt.id).await.unwrap().status, "online");
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (_, svc) = service(vec![]).await;
        let err = svc.monitor_device("switch", 1).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let err = svc
            .record_bandwidth(&RecordBandwidthRequest {
                device_type: "switch".into(),
                ..sample(1, 1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_device_statuses_summary() {
        let (_, svc) = service(vec![Ok(DeviceHealth::default()), down()]).await;
        svc.monitor_device("router", 1).await.unwrap();
        svc.monitor_device("router", 2).await.unwrap();
        let summary = svc.device_statuses().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.online + summary.degraded + summary.unreachable + summary.unknown, 2);
    }

    #[tokio::test]
    async fn test_hourly_then_daily_rollup() {
        let (_, svc) = service(vec![]).await;
        svc.record_bandwidth_at(&sample(100, 1000), at("2026-03-01T10:05:00Z")).await.unwrap();
        svc.record_bandwidth_at(&sample(50, 500), at("2026-03-01T10:55:00Z")).await.unwrap();
        svc.record_bandwidth_at(&sample(10, 10), at("2026-03-01T11:10:00Z")).await.unwrap();
        // current hour stays raw
        svc.record_bandwidth_at(&sample(1, 1), at("2026-03-02T09:30:00Z")).await.unwrap();

        let now = at("2026-03-02T09:45:00Z");
        assert_eq!(svc.aggregate_hourly(now).await.unwrap(), 2);
        assert_eq!(svc.aggregate_hourly(now).await.unwrap(), 0);

        let hourly = svc
            .bandwidth_usage(
                "router",
                1,
                &BandwidthQuery {
                    period: "hourly".into(),
                    from: Some(at("2026-03-01T00:00:00Z")),
                    to: Some(at("2026-03-02T00:00:00Z")),
                },
            )
            .await
            .unwrap();
        assert_eq!(hourly.points.len(), 2);
        assert_eq!(hourly.points[0].period_start, at("2026-03-01T10:00:00Z"));
        assert_eq!(hourly.points[0].upload_bytes, 150);
        assert_eq!(hourly.points[0].samples, 2);
        assert_eq!(hourly.total, 1670);

        assert_eq!(svc.aggregate_daily(now).await.unwrap(), 1);
        let daily = svc
            .bandwidth_usage(
                "router",
                1,
                &BandwidthQuery {
                    period: "daily".into(),
                    from: Some(at("2026-02-20T00:00:00Z")),
                    to: Some(at("2026-03-03T00:00:00Z")),
                },
            )
            .await
            .unwrap();
        assert_eq!(daily.points.len(), 1);
        assert_eq!(daily.total_upload, 160);
        assert_eq!(daily.total_download, 1510);
        assert_eq!(daily.points[0].samples, 3);

        let raw = svc
            .bandwidth_usage(
                "router",
                1,
                &BandwidthQuery {
                    period: "raw".into(),
                    from: Some(at("2026-03-02T00:00:00Z")),
                    to: Some(at("2026-03-03T00:00:00Z")),
                },
            )
            .await
            .unwrap();
        assert_eq!(raw.points.len(), 1);
    }

    #[tokio::test]
    async fn test_bandwidth_query_validation() {
        let (_, svc) = service(vec![]).await;
        let err = svc
            .bandwidth_usage(
                "router",
                1,
                &BandwidthQuery {
                    period: "weekly".into(),
                    from: None,
                    to: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let err = svc.record_bandwidth(&sample(-1, 0)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(bucket_start(at("2026-03-01T10:59:59Z"), HOUR_SECS), at("2026-03-01T10:00:00Z"));
        assert_eq!(bucket_start(at("2026-03-01T10:59:59Z"), DAY_SECS), at("2026-03-01T00:00:00Z"));
    }
}
