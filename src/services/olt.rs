//! OLT/ONU engine: discovery, registry sync, ONU commands, backups.
//!
//! Every device exchange is bounded by a timeout and serialized per OLT.
//! Reads go over SNMP when the vendor dialect supports it and the OLT is not
//! configured for SSH management; everything else goes over the CLI.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::db::{OnuRepo, Store};
use crate::error::{NetError, NetResult};
use crate::models::*;
use crate::protocols::snmp::oid_suffix;
use crate::protocols::{CliClient, OltConnector, SnmpClient, SnmpValue};
use crate::utils::{self, KeyedLocks};
use crate::vendor::{self, Dialect, OnuOids, Vendor};

#[derive(Debug, Clone)]
pub struct OltSettings {
    /// Budget for one device exchange (one walk set, one CLI run)
    pub operation_timeout: Duration,
    /// Wait before re-polling an ONU to confirm a command took effect
    pub confirm_delay: Duration,
    pub backup_dir: PathBuf,
    pub backup_attempts: u32,
    pub backup_retry_delay: Duration,
}

/// How reads reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Snmp,
    Cli,
}

fn read_transport(olt: &Olt, dialect: &Dialect) -> Option<Transport> {
    let snmp_ok = dialect.snmp.is_some() && dialect.snmp_reads && !olt.snmp_community.is_empty();
    let cli_ok = dialect.cli.is_some();
    if olt.management_protocol == management_protocol::SSH && cli_ok {
        return Some(Transport::Cli);
    }
    if snmp_ok {
        return Some(Transport::Snmp);
    }
    cli_ok.then_some(Transport::Cli)
}

fn olt_key(olt_id: i64) -> String {
    format!("olt:{}", olt_id)
}

/// Serial as stored: printable alphanumerics, uppercased
fn clean_serial(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

#[derive(Clone)]
pub struct OltService {
    store: Store,
    connector: Arc<dyn OltConnector>,
    locks: KeyedLocks,
    settings: Arc<OltSettings>,
}

impl OltService {
    pub fn new(store: Store, connector: Arc<dyn OltConnector>, settings: OltSettings) -> Self {
        Self {
            store,
            connector,
            locks: KeyedLocks::new(),
            settings: Arc::new(settings),
        }
    }

    async fn bounded<T, F>(&self, operation: &str, olt: &Olt, fut: F) -> NetResult<T>
    where
        F: Future<Output = NetResult<T>>,
    {
        self.bounded_for(self.settings.operation_timeout, operation, olt, fut).await
    }

    async fn bounded_for<T, F>(&self, budget: Duration, operation: &str, olt: &Olt, fut: F) -> NetResult<T>
    where
        F: Future<Output = NetResult<T>>,
    {
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                operation: format!("{} on OLT {}", operation, olt.name),
                secs: budget.as_secs(),
            }),
        }
    }

    // ========== OLT Registry ==========

    pub async fn list_olts(&self, scope: &TenantScope) -> NetResult<Vec<Olt>> {
        Ok(self.store.list_olts(scope).await?)
    }

    pub async fn get_olt(&self, scope: &TenantScope, olt_id: i64) -> NetResult<Olt> {
        match self.store.get_olt(olt_id).await? {
            Some(olt) if scope.allows(olt.tenant_id) => Ok(olt),
            _ => Err(NetError::not_found("OLT", olt_id)),
        }
    }

    /// Register an OLT; the vendor is detected once from brand, model and name
    pub async fn create_olt(&self, scope: &TenantScope, req: &CreateOltRequest) -> NetResult<Olt> {
        if req.name.trim().is_empty() {
            return Err(NetError::invalid("OLT name is required"));
        }
        if !utils::is_valid_ipv4(&req.ip_address) {
            return Err(NetError::invalid(format!("invalid OLT address {:?}", req.ip_address)));
        }
        if let Some(proto) = req.management_protocol.as_deref() {
            if proto != management_protocol::SNMP && proto != management_protocol::SSH {
                return Err(NetError::invalid(format!("unknown management protocol {:?}", proto)));
            }
        }
        let vendor = Vendor::detect_from_fields(&[&req.brand, &req.model, &req.name]);
        let olt = self.store.create_olt(scope.tenant_id, req, vendor.as_str()).await?;
        tracing::info!("Registered OLT {} ({}) as {}", olt.name, olt.ip_address, vendor);
        Ok(olt)
    }

    // ========== Connectivity ==========

    /// Read-only reachability probe with latency; never hangs past the timeout
    pub async fn test_connection(&self, scope: &TenantScope, olt_id: i64) -> NetResult<ConnectionTest> {
        let olt = self.get_olt(scope, olt_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let started = std::time::Instant::now();
        let outcome = self.bounded("connection test", &olt, self.probe(&olt)).await;
        let status = if outcome.is_ok() { device_status::ONLINE } else { device_status::OFFLINE };
        self.store.update_olt_status(olt.id, status).await?;
        Ok(match outcome {
            Ok(description) => ConnectionTest {
                success: true,
                message: description,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!("Connection test for OLT {} failed: {}", olt.name, e);
                ConnectionTest {
                    success: false,
                    message: e.to_string(),
                    latency_ms: None,
                }
            }
        })
    }

    async fn probe(&self, olt: &Olt) -> NetResult<String> {
        let dialect = self.dialect(olt);
        match read_transport(olt, dialect) {
            Some(Transport::Snmp) => {
                let value = self.connector.snmp(olt).get(vendor::SYS_DESCR_OID).await?;
                Ok(value.and_then(|v| v.as_text()).unwrap_or_else(|| "SNMP agent reachable".into()))
            }
            Some(Transport::Cli) | None => {
                let version = dialect.cli.as_ref().map(|c| c.version).unwrap_or("show version");
                let out = self.connector.cli(olt).run(&[version.to_string()]).await?;
                Ok(out
                    .first()
                    .and_then(|o| o.lines().find(|l| !l.trim().is_empty()))
                    .map(|l| l.trim().to_string())
                    .unwrap_or_else(|| "CLI reachable".into()))
            }
        }
    }

    fn dialect(&self, olt: &Olt) -> &'static Dialect {
        Vendor::from_tag(&olt.vendor).dialect()
    }

    // ========== Discovery ==========

    /// Best-effort ONU inventory; unreadable ports are reported, not fatal
    pub async fn discover_onus(&self, scope: &TenantScope, olt_id: i64) -> NetResult<DiscoveryResult> {
        let olt = self.get_olt(scope, olt_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        self.discover(&olt).await
    }

    async fn discover(&self, olt: &Olt) -> NetResult<DiscoveryResult> {
        let dialect = self.dialect(olt);
        let result = match (read_transport(olt, dialect), dialect.snmp.as_ref()) {
            (Some(Transport::Snmp), Some(oids)) => {
                self.bounded("SNMP discovery", olt, self.discover_snmp(olt, dialect, oids))
                    .await?
            }
            (Some(_), _) => self.discover_cli(olt, dialect).await,
            (None, _) => {
                return Err(NetError::invalid(format!(
                    "no discovery transport for {} OLT {}",
                    dialect.vendor, olt.name
                )))
            }
        };
        tracing::info!(
            "Discovered {} ONUs on OLT {} ({} ports failed)",
            result.onus.len(),
            olt.name,
            result.failed_ports.len()
        );
        Ok(dedupe(result))
    }

    async fn discover_snmp(&self, olt: &Olt, dialect: &Dialect, oids: &OnuOids) -> NetResult<DiscoveryResult> {
        let client = self.connector.snmp(olt);
        let mut serials = client.walk(oids.serial).await?;
        let mut serial_base = oids.serial;
        if serials.is_empty() {
            if let Some(fallback) = oids.serial_fallback {
                serials = client.walk(fallback).await?;
                serial_base = fallback;
            }
        }

        let status = column(client.as_ref(), oids.status, "status", &olt.name).await;
        let rx = column(client.as_ref(), oids.rx_power, "rx power", &olt.name).await;
        let tx = column(client.as_ref(), oids.tx_power, "tx power", &olt.name).await;
        let distance = column(client.as_ref(), oids.distance, "distance", &olt.name).await;

        let mut onus = Vec::new();
        for (oid, value) in serials {
            let Some(suffix) = oid_suffix(serial_base, &oid) else { continue };
            let Some((pon_port, onu_id)) = dialect.decode_index(&suffix) else { continue };
            let serial_number = value.as_text().map(|s| clean_serial(&s)).unwrap_or_default();
            if serial_number.is_empty() {
                continue;
            }
            onus.push(DiscoveredOnu {
                serial_number,
                pon_port,
                onu_id,
                status: match status.get(&suffix).and_then(SnmpValue::as_i64) {
                    Some(raw) if dialect.is_online_value(raw) => onu_status::ONLINE.to_string(),
                    Some(_) => onu_status::OFFLINE.to_string(),
                    None => onu_status::UNKNOWN.to_string(),
                },
                signal_rx: rx.get(&suffix).and_then(SnmpValue::as_i64).and_then(|r| dialect.scale_power(r)),
                signal_tx: tx.get(&suffix).and_then(SnmpValue::as_i64).and_then(|r| dialect.scale_power(r)),
                distance: distance
                    .get(&suffix)
                    .and_then(SnmpValue::as_i64)
                    .filter(|d| *d >= 0 && *d != vendor::SNMP_NO_READING),
            });
        }
        Ok(DiscoveryResult {
            onus,
            failed_ports: Vec::new(),
        })
    }

    /// One CLI run per port so a bad port only loses itself
    async fn discover_cli(&self, olt: &Olt, dialect: &Dialect) -> DiscoveryResult {
        let mut result = DiscoveryResult::default();
        let Some(cli) = dialect.cli.as_ref() else {
            return result;
        };
        let client = self.connector.cli(olt);
        let ports = dialect.pon_ports(olt.pon_port_count);
        let deadline = Instant::now() + self.settings.operation_timeout * (ports.len().max(1) as u32);

        for port in ports {
            if Instant::now() >= deadline {
                result.failed_ports.push(PortFailure {
                    pon_port: port,
                    error: "discovery deadline exceeded".into(),
                });
                continue;
            }
            let command = vendor::render(cli.list_port, &port, 0, "");
            let outcome = self
                .bounded("ONU listing", olt, client.run(std::slice::from_ref(&command)))
                .await;
            match outcome {
                Ok(outputs) => {
                    let text = outputs.join("\n");
                    if utils::looks_like_cli_error(&text) {
                        tracing::warn!("OLT {} rejected listing of port {}", olt.name, port);
                        result.failed_ports.push(PortFailure {
                            pon_port: port,
                            error: text.lines().next().unwrap_or_default().trim().to_string(),
                        });
                        continue;
                    }
                    result.onus.extend(dialect.parse_onu_list(&text));
                }
                Err(e) => {
                    tracing::warn!("Discovery of port {} on OLT {} failed: {}", port, olt.name, e);
                    result.failed_ports.push(PortFailure {
                        pon_port: port,
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    // ========== Registry Sync ==========

    /// Reconcile discovery output into the registry. Rows are never deleted.
    pub async fn sync_onus(&self, scope: &TenantScope, olt_id: i64) -> NetResult<SyncResult> {
        let olt = self.get_olt(scope, olt_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let discovery = self.discover(&olt).await?;

        let now = Utc::now();
        let failed: HashSet<&str> = discovery.failed_ports.iter().map(|f| f.pon_port.as_str()).collect();
        let mut result = SyncResult::default();

        let mut tx = self.store.pool().begin().await?;
        let existing = OnuRepo::list_in(&mut *tx, olt.id).await?;
        // Rows already moved out of a slot lose to the row still holding one
        let mut by_serial: HashMap<&str, &Onu> = HashMap::new();
        for row in &existing {
            let keep = by_serial
                .get(row.serial_number.as_str())
                .is_some_and(|held| held.onu_id >= 0);
            if !keep {
                by_serial.insert(row.serial_number.as_str(), row);
            }
        }
        let mut slots: HashMap<(String, i64), i64> = existing
            .iter()
            .filter(|o| o.onu_id >= 0)
            .map(|o| ((o.pon_port.clone(), o.onu_id), o.id))
            .collect();
        let mut matched: HashSet<i64> = HashSet::new();

        for onu in &discovery.onus {
            let row = by_serial
                .get(onu.serial_number.as_str())
                .copied()
                .filter(|row| !matched.contains(&row.id));
            let slot = (onu.pon_port.clone(), onu.onu_id);
            if let Some(&occupant) = slots.get(&slot) {
                if row.map(|r| r.id) != Some(occupant) {
                    tracing::info!(
                        "ONU slot {}:{} now holds {}; previous row {} kept out of slot",
                        onu.pon_port,
                        onu.onu_id,
                        onu.serial_number,
                        occupant
                    );
                    OnuRepo::move_out_of_slot(&mut *tx, occupant, now).await?;
                    slots.remove(&slot);
                }
            }
            match row {
                Some(row) => {
                    if row.pon_port != onu.pon_port || row.onu_id != onu.onu_id {
                        tracing::info!(
                            "ONU {} moved from {}:{} to {}:{}",
                            onu.serial_number,
                            row.pon_port,
                            row.onu_id,
                            onu.pon_port,
                            onu.onu_id
                        );
                        let old_slot = (row.pon_port.clone(), row.onu_id);
                        if slots.get(&old_slot) == Some(&row.id) {
                            slots.remove(&old_slot);
                        }
                    }
                    OnuRepo::update_from_discovery(&mut *tx, row.id, onu, now).await?;
                    slots.insert(slot, row.id);
                    matched.insert(row.id);
                    result.updated += 1;
                }
                None => {
                    let id = OnuRepo::insert(&mut *tx, &olt, onu, now).await?;
                    slots.insert(slot, id);
                    matched.insert(id);
                    result.created += 1;
                }
            }
        }

        for row in &existing {
            if matched.contains(&row.id) || failed.contains(row.pon_port.as_str()) {
                continue;
            }
            if row.status != onu_status::OFFLINE {
                OnuRepo::mark_offline(&mut *tx, row.id, now).await?;
                result.marked_offline += 1;
            }
        }
        tx.commit().await?;

        self.store.touch_olt_sync(olt.id).await?;
        for row in &existing {
            if row.auth_state == onu_auth_state::PENDING_RECHECK && matched.contains(&row.id) {
                let online = discovery
                    .onus
                    .iter()
                    .any(|d| d.serial_number == row.serial_number && d.status == onu_status::ONLINE);
                if online {
                    self.store.set_onu_auth_state(row.id, onu_auth_state::AUTHORIZED).await?;
                }
            }
        }

        result.touched = result.created + result.updated + result.marked_offline;
        result.failed_ports = discovery.failed_ports;
        tracing::info!(
            "Synced OLT {}: {} created, {} updated, {} marked offline",
            olt.name,
            result.created,
            result.updated,
            result.marked_offline
        );
        Ok(result)
    }

    // ========== ONU Operations ==========

    pub async fn list_onus(&self, scope: &TenantScope, olt_id: i64) -> NetResult<Vec<Onu>> {
        let olt = self.get_olt(scope, olt_id).await?;
        Ok(self.store.list_onus(olt.id).await?)
    }

    pub async fn get_onu(&self, scope: &TenantScope, onu_id: i64) -> NetResult<Onu> {
        match self.store.get_onu(onu_id).await? {
            Some(onu) if scope.allows(onu.tenant_id) => Ok(onu),
            _ => Err(NetError::not_found("ONU", onu_id)),
        }
    }

    async fn onu_with_olt(&self, scope: &TenantScope, onu_id: i64) -> NetResult<(Onu, Olt)> {
        let onu = self.get_onu(scope, onu_id).await?;
        let olt = self.get_olt(scope, onu.olt_id).await?;
        Ok((onu, olt))
    }

    /// Live single-ONU poll; `None` when the device does not list it
    async fn poll_onu(&self, olt: &Olt, onu: &Onu) -> NetResult<Option<DiscoveredOnu>> {
        let dialect = self.dialect(olt);
        match (read_transport(olt, dialect), dialect.snmp.as_ref()) {
            (Some(Transport::Snmp), Some(oids)) => {
                self.bounded("ONU poll", olt, async {
                    let client = self.connector.snmp(olt);
                    let Some(suffix) = find_index(client.as_ref(), dialect, oids, onu).await? else {
                        return Ok(None);
                    };
                    let read = |base: &'static str| {
                        let oid = format!("{}.{}", base, join_suffix(&suffix));
                        let client = client.clone();
                        async move { client.get(&oid).await.ok().flatten().and_then(|v| v.as_i64()) }
                    };
                    let status = read(oids.status).await;
                    let rx = read(oids.rx_power).await;
                    let tx = read(oids.tx_power).await;
                    let distance = read(oids.distance).await;
                    Ok(Some(DiscoveredOnu {
                        serial_number: onu.serial_number.clone(),
                        pon_port: onu.pon_port.clone(),
                        onu_id: onu.onu_id,
                        status: match status {
                            Some(raw) if dialect.is_online_value(raw) => onu_status::ONLINE.to_string(),
                            Some(_) => onu_status::OFFLINE.to_string(),
                            None => onu_status::UNKNOWN.to_string(),
                        },
                        signal_rx: rx.and_then(|r| dialect.scale_power(r)),
                        signal_tx: tx.and_then(|r| dialect.scale_power(r)),
                        distance: distance.filter(|d| *d >= 0 && *d != vendor::SNMP_NO_READING),
                    }))
                })
                .await
            }
            (Some(_), _) => {
                let Some(cli) = dialect.cli.as_ref() else {
                    return Ok(None);
                };
                let command = vendor::render(cli.list_port, &onu.pon_port, onu.onu_id, &onu.serial_number);
                let outputs = self
                    .bounded("ONU poll", olt, self.connector.cli(olt).run(&[command]))
                    .await?;
                let listed = dialect.parse_onu_list(&outputs.join("\n"));
                let by_serial = listed.iter().position(|d| d.serial_number == onu.serial_number);
                let by_slot = || listed.iter().position(|d| d.onu_id == onu.onu_id);
                Ok(by_serial.or_else(by_slot).map(|i| listed[i].clone()))
            }
            (None, _) => Err(NetError::invalid(format!("no read transport for OLT {}", olt.name))),
        }
    }

    /// Live status snapshot without touching the registry
    pub async fn get_onu_status(&self, scope: &TenantScope, onu_id: i64) -> NetResult<OnuStatusSnapshot> {
        let (onu, olt) = self.onu_with_olt(scope, onu_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let polled = self.poll_onu(&olt, &onu).await?;
        Ok(match polled {
            Some(p) => OnuStatusSnapshot {
                onu_id: onu.id,
                status: p.status,
                signal_rx: p.signal_rx,
                signal_tx: p.signal_tx,
                distance: p.distance.or(onu.distance),
                uptime: None,
                last_update: Utc::now(),
            },
            None => OnuStatusSnapshot {
                onu_id: onu.id,
                status: onu_status::OFFLINE.to_string(),
                signal_rx: None,
                signal_tx: None,
                distance: onu.distance,
                uptime: None,
                last_update: Utc::now(),
            },
        })
    }

    /// Poll one ONU and persist the result
    pub async fn refresh_onu_status(&self, scope: &TenantScope, onu_id: i64) -> NetResult<Onu> {
        let (onu, olt) = self.onu_with_olt(scope, onu_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let polled = self.poll_onu(&olt, &onu).await?;
        let updated = match polled {
            Some(p) => {
                self.store
                    .update_onu_status(onu.id, &p.status, p.signal_rx, p.signal_tx, p.distance)
                    .await?
            }
            None => {
                self.store
                    .update_onu_status(onu.id, onu_status::OFFLINE, None, None, None)
                    .await?
            }
        };
        if updated.auth_state == onu_auth_state::PENDING_RECHECK && updated.status == onu_status::ONLINE {
            self.store.set_onu_auth_state(updated.id, onu_auth_state::AUTHORIZED).await?;
            return self.get_onu(scope, onu_id).await;
        }
        Ok(updated)
    }

    pub async fn authorize_onu(&self, scope: &TenantScope, onu_id: i64) -> NetResult<OnuCommandResult> {
        self.change_authorization(scope, onu_id, true).await
    }

    pub async fn unauthorize_onu(&self, scope: &TenantScope, onu_id: i64) -> NetResult<OnuCommandResult> {
        self.change_authorization(scope, onu_id, false).await
    }

    /// Poll, send the command, wait, poll again. Local state only moves when
    /// the two polls show the expected transition.
    async fn change_authorization(&self, scope: &TenantScope, onu_id: i64, authorize: bool) -> NetResult<OnuCommandResult> {
        let (onu, olt) = self.onu_with_olt(scope, onu_id).await?;
        let dialect = self.dialect(&olt);
        let cli = dialect.cli.as_ref().ok_or_else(|| {
            NetError::invalid(format!("{} OLTs do not support ONU authorization", dialect.vendor))
        })?;
        let template = if authorize { cli.authorize } else { cli.unauthorize };
        let command = vendor::render(template, &onu.pon_port, onu.onu_id, &onu.serial_number);
        let action = if authorize { "authorize" } else { "unauthorize" };

        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let before = self.poll_onu(&olt, &onu).await?;
        let outputs = self
            .bounded("ONU authorization", &olt, self.connector.cli(&olt).run(&[command]))
            .await?;
        let transcript = outputs.join("\n");
        if utils::looks_like_cli_error(&transcript) {
            return Err(NetError::DeviceRejected(transcript.trim().to_string()));
        }

        sleep(self.settings.confirm_delay).await;
        let after = self.poll_onu(&olt, &onu).await?;
        let was_online = before.as_ref().is_some_and(|p| p.status == onu_status::ONLINE);
        let is_online = after.as_ref().is_some_and(|p| p.status == onu_status::ONLINE);
        let confirmed = match (authorize, &after) {
            (true, _) => is_online && !was_online,
            (false, None) => true,
            (false, Some(p)) => p.status == onu_status::OFFLINE && was_online,
        };

        if !confirmed {
            // Already online before the command: the poll cannot tell whether it took
            if authorize && was_online && is_online && onu.auth_state != onu_auth_state::AUTHORIZED {
                self.store.set_onu_auth_state(onu.id, onu_auth_state::PENDING_RECHECK).await?;
                tracing::info!("ONU {} on OLT {}: authorize unverifiable, pending recheck", onu.serial_number, olt.name);
                return Ok(OnuCommandResult {
                    onu_id: onu.id,
                    auth_state: onu_auth_state::PENDING_RECHECK.to_string(),
                    confirmed: false,
                    message: "device accepted authorize; ONU was already online so it needs a recheck".to_string(),
                });
            }
            tracing::warn!("OLT {} did not confirm {} of ONU {}", olt.name, action, onu.serial_number);
            return Ok(OnuCommandResult {
                onu_id: onu.id,
                auth_state: onu.auth_state,
                confirmed: false,
                message: format!("device accepted {} but the ONU state did not change", action),
            });
        }

        let state = if authorize { onu_auth_state::AUTHORIZED } else { onu_auth_state::UNAUTHORIZED };
        self.store.set_onu_auth_state(onu.id, state).await?;
        tracing::info!("ONU {} on OLT {}: {} confirmed", onu.serial_number, olt.name, action);
        Ok(OnuCommandResult {
            onu_id: onu.id,
            auth_state: state.to_string(),
            confirmed: true,
            message: format!("{} confirmed", action),
        })
    }

    /// Reboot one ONU; it comes back as pending recheck until seen online again
    pub async fn reboot_onu(&self, scope: &TenantScope, onu_id: i64) -> NetResult<OnuCommandResult> {
        let (onu, olt) = self.onu_with_olt(scope, onu_id).await?;
        let dialect = self.dialect(&olt);
        let _guard = self.locks.lock(&olt_key(olt.id)).await;

        let snmp_reboot = dialect
            .snmp
            .as_ref()
            .filter(|_| read_transport(&olt, dialect) == Some(Transport::Snmp))
            .and_then(|oids| oids.reboot.map(|r| (oids, r)));
        match (snmp_reboot, dialect.cli.as_ref()) {
            (Some((oids, (base, value))), _) => {
                self.bounded("ONU reboot", &olt, async {
                    let client = self.connector.snmp(&olt);
                    let suffix = find_index(client.as_ref(), dialect, oids, &onu)
                        .await?
                        .ok_or_else(|| NetError::not_found("ONU on device", &onu.serial_number))?;
                    client
                        .set_integer(&format!("{}.{}", base, join_suffix(&suffix)), value)
                        .await
                })
                .await?;
            }
            (None, Some(cli)) => {
                let command = vendor::render(cli.reboot, &onu.pon_port, onu.onu_id, &onu.serial_number);
                let outputs = self
                    .bounded("ONU reboot", &olt, self.connector.cli(&olt).run(&[command]))
                    .await?;
                let transcript = outputs.join("\n");
                if utils::looks_like_cli_error(&transcript) {
                    return Err(NetError::DeviceRejected(transcript.trim().to_string()));
                }
            }
            (None, None) => {
                return Err(NetError::invalid(format!("{} OLTs do not support ONU reboot", dialect.vendor)));
            }
        }

        let state = if onu.auth_state == onu_auth_state::AUTHORIZED {
            self.store.set_onu_auth_state(onu.id, onu_auth_state::PENDING_RECHECK).await?;
            onu_auth_state::PENDING_RECHECK.to_string()
        } else {
            onu.auth_state.clone()
        };
        tracing::info!("Reboot sent to ONU {} on OLT {}", onu.serial_number, olt.name);
        Ok(OnuCommandResult {
            onu_id: onu.id,
            auth_state: state,
            confirmed: false,
            message: "reboot sent; status will be rechecked".into(),
        })
    }

    /// Attach or detach the network user served by an ONU
    pub async fn link_onu(&self, scope: &TenantScope, onu_id: i64, network_user_id: Option<i64>) -> NetResult<Onu> {
        let onu = self.get_onu(scope, onu_id).await?;
        if let Some(user_id) = network_user_id {
            match self.store.get_network_user(user_id).await? {
                Some(user) if scope.allows(user.tenant_id) => {}
                _ => return Err(NetError::not_found("Network user", user_id)),
            }
        }
        Ok(self.store.link_onu_network_user(onu.id, network_user_id).await?)
    }

    // ========== Health & Statistics ==========

    /// Device gauges. CLI-only devices report reachability with empty gauges.
    pub async fn poll_health(&self, olt: &Olt) -> NetResult<DeviceHealth> {
        let _guard = self.locks.lock(&olt_key(olt.id)).await;
        let dialect = self.dialect(olt);
        if read_transport(olt, dialect) != Some(Transport::Snmp) {
            self.bounded("health probe", olt, self.probe(olt)).await?;
            return Ok(DeviceHealth::default());
        }
        self.bounded("health poll", olt, async {
            let client = self.connector.snmp(olt);
            let uptime = client.get(vendor::SYS_UPTIME_OID).await?;
            let first = |base: Option<&'static str>| {
                let client = client.clone();
                async move {
                    let base = base?;
                    let rows = client.walk(base).await.ok()?;
                    rows.iter().find_map(|(_, v)| v.as_i64()).map(|v| v as f64)
                }
            };
            Ok(DeviceHealth {
                uptime_seconds: uptime.and_then(|v| v.as_i64()).map(|ticks| ticks / 100),
                cpu_usage: first(dialect.health.cpu).await,
                memory_usage: first(dialect.health.memory).await,
                temperature: first(dialect.health.temperature).await,
            })
        })
        .await
    }

    /// Health gauges plus registry counts; the gauges are persisted on the OLT row
    pub async fn statistics(&self, scope: &TenantScope, olt_id: i64) -> NetResult<OltStatistics> {
        let olt = self.get_olt(scope, olt_id).await?;
        let health = match self.poll_health(&olt).await {
            Ok(health) => {
                self.store.update_olt_health(olt.id, &health).await?;
                health
            }
            Err(e) => {
                tracing::warn!("Health poll for OLT {} failed: {}", olt.name, e);
                DeviceHealth {
                    uptime_seconds: olt.uptime_seconds,
                    temperature: olt.temperature,
                    cpu_usage: olt.cpu_usage,
                    memory_usage: olt.memory_usage,
                }
            }
        };
        let counts = self.store.onu_counts(olt.id).await?;
        Ok(OltStatistics {
            olt_id: olt.id,
            uptime_seconds: health.uptime_seconds,
            temperature: health.temperature,
            cpu_usage: health.cpu_usage,
            memory_usage: health.memory_usage,
            total_onus: counts.total,
            online_onus: counts.online,
            offline_onus: counts.offline,
        })
    }

    // ========== Backups & Configuration ==========

    /// Fetch the running config (read-only, retried) and store it.
    /// The file lands via temp-file + rename before its row exists.
    pub async fn create_backup(&self, scope: &TenantScope, olt_id: i64) -> NetResult<OltBackup> {
        let olt = self.get_olt(scope, olt_id).await?;
        let dialect = self.dialect(&olt);
        let cli = dialect
            .cli
            .as_ref()
            .ok_or_else(|| NetError::invalid(format!("{} OLTs do not support config backup", dialect.vendor)))?;
        let command = cli.running_config.to_string();

        let config = {
            let _guard = self.locks.lock(&olt_key(olt.id)).await;
            let mut last_error = None;
            let mut config = None;
            for attempt in 1..=self.settings.backup_attempts.max(1) {
                let outcome = self
                    .bounded(
                        "config backup",
                        &olt,
                        self.connector.cli(&olt).run(std::slice::from_ref(&command)),
                    )
                    .await;
                match outcome {
                    Ok(outputs) => {
                        config = Some(outputs.join("\n"));
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Backup attempt {} for OLT {} failed: {}", attempt, olt.name, e);
                        last_error = Some(e);
                        sleep(self.settings.backup_retry_delay * attempt).await;
                    }
                }
            }
            match (config, last_error) {
                (Some(config), _) => config,
                (None, Some(e)) => return Err(e),
                (None, None) => return Err(NetError::DeviceUnreachable(format!("no backup taken from {}", olt.name))),
            }
        };
        if config.trim().is_empty() {
            return Err(NetError::DeviceRejected(format!("OLT {} returned an empty configuration", olt.name)));
        }

        let filename = format!(
            "olt{}_{}_{}.cfg",
            olt.id,
            Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        write_atomically(&self.settings.backup_dir, &filename, &config).await?;
        let backup = match self.store.create_olt_backup(olt.id, &filename, config.len() as i64).await {
            Ok(backup) => backup,
            Err(e) => {
                let _ = tokio::fs::remove_file(self.settings.backup_dir.join(&filename)).await;
                return Err(e.into());
            }
        };
        tracing::info!("Backup {} created for OLT {} ({} bytes)", backup.filename, olt.name, backup.size);
        Ok(backup)
    }

    pub async fn list_backups(&self, scope: &TenantScope, olt_id: i64) -> NetResult<Vec<OltBackup>> {
        let olt = self.get_olt(scope, olt_id).await?;
        Ok(self.store.list_olt_backups(olt.id).await?)
    }

    /// Backup metadata and file content
    pub async fn export_backup(&self, scope: &TenantScope, backup_id: i64) -> NetResult<(OltBackup, String)> {
        let backup = self
            .store
            .get_olt_backup(backup_id)
            .await?
            .ok_or_else(|| NetError::not_found("Backup", backup_id))?;
        self.get_olt(scope, backup.olt_id).await?;
        let path = self.settings.backup_dir.join(&backup.filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok((backup, content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NetError::not_found("Backup file", &backup.filename)),
            Err(e) => Err(NetError::Storage(format!("reading {}: {}", path.display(), e))),
        }
    }

    /// Push CLI lines once. Never retried; the outcome is recorded either way.
    pub async fn apply_configuration(&self, scope: &TenantScope, olt_id: i64, commands: &[String]) -> NetResult<ConfigApplyResult> {
        let commands: Vec<String> = commands
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if commands.is_empty() {
            return Err(NetError::invalid("no configuration commands given"));
        }
        let olt = self.get_olt(scope, olt_id).await?;
        let _guard = self.locks.lock(&olt_key(olt.id)).await;

        let budget = self.settings.operation_timeout * (commands.len() as u32 + 1);
        let outcome = self
            .bounded_for(budget, "configuration", &olt, self.connector.cli(&olt).run(&commands))
            .await;
        let result = match &outcome {
            Ok(outputs) => {
                let output = outputs.join("\n");
                let rejected = utils::looks_like_cli_error(&output);
                ConfigApplyResult {
                    olt_id: olt.id,
                    success: !rejected,
                    error: rejected.then(|| "device reported an error".to_string()),
                    output,
                }
            }
            Err(e) => ConfigApplyResult {
                olt_id: olt.id,
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
            },
        };
        self.store.record_olt_config_apply(olt.id, &commands, &result).await?;
        match outcome {
            Ok(_) => {
                tracing::info!("Applied {} config lines to OLT {} (success: {})", commands.len(), olt.name, result.success);
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }
}

/// Merge duplicate (port, onu) rows, keeping the first
fn dedupe(mut result: DiscoveryResult) -> DiscoveryResult {
    let mut seen = HashSet::new();
    result
        .onus
        .retain(|o| seen.insert((o.pon_port.clone(), o.onu_id)));
    result
}

/// Walk one column keyed by index suffix; a failed walk is an empty column
async fn column(client: &dyn SnmpClient, base: &str, what: &str, olt_name: &str) -> HashMap<Vec<u32>, SnmpValue> {
    match client.walk(base).await {
        Ok(rows) => rows
            .into_iter()
            .filter_map(|(oid, value)| oid_suffix(base, &oid).map(|s| (s, value)))
            .collect(),
        Err(e) => {
            tracing::warn!("Walking ONU {} on OLT {} failed: {}", what, olt_name, e);
            HashMap::new()
        }
    }
}

/// Table index of one registered ONU, found by walking the serial column
async fn find_index(client: &dyn SnmpClient, dialect: &Dialect, oids: &OnuOids, onu: &Onu) -> NetResult<Option<Vec<u32>>> {
    for base in std::iter::once(oids.serial).chain(oids.serial_fallback) {
        let rows = client.walk(base).await?;
        if rows.is_empty() {
            continue;
        }
        let found = rows.into_iter().find_map(|(oid, value)| {
            let suffix = oid_suffix(base, &oid)?;
            let serial = value.as_text().map(|s| clean_serial(&s)).unwrap_or_default();
            let position = dialect.decode_index(&suffix);
            let same_slot = position.as_ref().is_some_and(|(p, id)| *p == onu.pon_port && *id == onu.onu_id);
            (serial == onu.serial_number || same_slot).then_some(suffix)
        });
        return Ok(found);
    }
    Ok(None)
}

fn join_suffix(suffix: &[u32]) -> String {
    suffix.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".")
}

async fn write_atomically(dir: &Path, filename: &str, content: &str) -> NetResult<()> {
    let io = |e: std::io::Error| NetError::Storage(format!("writing backup {}: {}", filename, e));
    tokio::fs::create_dir_all(dir).await.map_err(io)?;
    let final_path = dir.join(filename);
    let temp_path = dir.join(format!(".{}.tmp", filename));
    tokio::fs::write(&temp_path, content).await.map_err(io)?;
    if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io(e));
    }
    Ok(())
}
