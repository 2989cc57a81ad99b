mod customers;
mod ipam;
mod monitoring;
mod network_users;
mod olts;
mod onus;
mod radius;
pub(crate) mod row_helpers;
mod routers;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::models::*;

pub use ipam::{PoolGeometry, ReleaseOutcome};
pub use monitoring::BandwidthRow;
pub use onus::{OnuCounts, OnuRepo};
pub use radius::RadiusStore;

use customers::{CustomerRepo, PackageMappingRepo};
use ipam::{IpAllocationRepo, IpPoolRepo};
use monitoring::MonitorRepo;
use network_users::NetworkUserRepo;
use olts::OltRepo;
use routers::RouterRepo;

/// Typed error for "resource not found", downcast at the service layer
/// in the error translation layers instead of string matching.
#[derive(Debug)]
pub struct NotFoundError {
    pub resource: String,
    pub id: String,
}

impl NotFoundError {
    pub fn new(resource: &str, id: &str) -> Self {
        Self {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} not found: {}", self.resource, self.id)
    }
}

impl std::error::Error for NotFoundError {}

/// Store handles all application database operations, delegating to per-entity repo modules.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a new database store with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Cheap liveness query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Raw pool access for multi-statement work (ONU sync)
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ========== IP Pool Operations ==========

    pub async fn list_pools(&self, scope: &TenantScope) -> Result<Vec<IpPool>> {
        IpPoolRepo::list(&self.pool, scope).await
    }

    pub async fn get_pool(&self, id: i64) -> Result<Option<IpPool>> {
        IpPoolRepo::get(&self.pool, id).await
    }

    pub async fn find_overlapping_pools(
        &self,
        tenant_id: Option<i64>,
        cidr: &crate::utils::CidrInfo,
    ) -> Result<Vec<IpPool>> {
        IpPoolRepo::find_overlapping(&self.pool, tenant_id, cidr).await
    }

    pub async fn create_pool(
        &self,
        tenant_id: Option<i64>,
        req: &CreateIpPoolRequest,
        geometry: &PoolGeometry,
    ) -> Result<IpPool> {
        IpPoolRepo::create(&self.pool, tenant_id, req, geometry).await
    }

    pub async fn update_pool(&self, id: i64, req: &UpdateIpPoolRequest) -> Result<IpPool> {
        IpPoolRepo::update(&self.pool, id, req).await
    }

    pub async fn delete_pool(&self, id: i64) -> Result<()> {
        IpPoolRepo::delete(&self.pool, id).await
    }

    pub async fn count_live_allocations(&self, pool_id: i64) -> Result<i64> {
        IpPoolRepo::count_live_allocations(&self.pool, pool_id).await
    }

    // ========== IP Allocation Operations ==========

    pub async fn get_allocation(&self, id: i64) -> Result<Option<IpAllocation>> {
        IpAllocationRepo::get(&self.pool, id).await
    }

    pub async fn list_allocations(&self, pool_id: i64) -> Result<Vec<IpAllocation>> {
        IpAllocationRepo::list_by_pool(&self.pool, pool_id).await
    }

    pub async fn live_addresses(&self, pool_id: i64) -> Result<Vec<u32>> {
        IpAllocationRepo::live_addresses(&self.pool, pool_id).await
    }

    pub async fn find_active_allocation_by_mac(&self, pool_id: i64, mac: &str) -> Result<Option<IpAllocation>> {
        IpAllocationRepo::find_active_by_mac(&self.pool, pool_id, mac).await
    }

    pub async fn find_live_allocation_by_address(&self, pool_id: i64, address: u32) -> Result<Option<IpAllocation>> {
        IpAllocationRepo::find_live_by_address(&self.pool, pool_id, address).await
    }

    pub async fn find_active_allocations_by_username(&self, username: &str) -> Result<Vec<IpAllocation>> {
        IpAllocationRepo::find_active_by_username(&self.pool, username).await
    }

    pub async fn insert_allocation(
        &self,
        ip_pool: &IpPool,
        address: u32,
        mac: &str,
        username: &str,
        status: &str,
    ) -> Result<Option<IpAllocation>> {
        IpAllocationRepo::insert(&self.pool, ip_pool, address, mac, username, status).await
    }

    pub async fn release_allocation(&self, id: i64) -> Result<ReleaseOutcome> {
        IpAllocationRepo::release(&self.pool, id).await
    }

    pub async fn allocation_history(&self, pool_id: i64) -> Result<Vec<AllocationHistoryEntry>> {
        IpAllocationRepo::history(&self.pool, pool_id).await
    }

    // ========== Router Operations ==========

    pub async fn list_routers(&self, scope: &TenantScope) -> Result<Vec<Router>> {
        RouterRepo::list(&self.pool, scope).await
    }

    pub async fn get_router(&self, id: i64) -> Result<Option<Router>> {
        RouterRepo::get(&self.pool, id).await
    }

    pub async fn create_router(&self, tenant_id: Option<i64>, req: &CreateRouterRequest) -> Result<Router> {
        RouterRepo::create(&self.pool, tenant_id, req).await
    }

    pub async fn update_router_status(&self, id: i64, status: &str) -> Result<()> {
        RouterRepo::update_status(&self.pool, id, status).await
    }

    pub async fn delete_router(&self, id: i64) -> Result<()> {
        RouterRepo::delete(&self.pool, id).await
    }

    // ========== Customer Mirror Operations ==========

    pub async fn list_customers(&self, scope: &TenantScope) -> Result<Vec<Customer>> {
        CustomerRepo::list(&self.pool, scope).await
    }

    pub async fn get_customer(&self, id: i64) -> Result<Option<Customer>> {
        CustomerRepo::get(&self.pool, id).await
    }

    pub async fn upsert_customer(&self, tenant_id: Option<i64>, req: &UpsertCustomerRequest) -> Result<Customer> {
        CustomerRepo::upsert(&self.pool, tenant_id, req).await
    }

    // ========== Package Mapping Operations ==========

    pub async fn list_package_mappings(&self, scope: &TenantScope) -> Result<Vec<PackageProfileMapping>> {
        PackageMappingRepo::list(&self.pool, scope).await
    }

    pub async fn find_package_mapping(&self, package_id: i64, router_id: i64) -> Result<Option<PackageProfileMapping>> {
        PackageMappingRepo::find(&self.pool, package_id, router_id).await
    }

    pub async fn create_package_mapping(
        &self,
        tenant_id: Option<i64>,
        req: &CreatePackageMappingRequest,
    ) -> Result<PackageProfileMapping> {
        PackageMappingRepo::create(&self.pool, tenant_id, req).await
    }

    pub async fn delete_package_mapping(&self, id: i64) -> Result<()> {
        PackageMappingRepo::delete(&self.pool, id).await
    }

    // ========== Network User Operations ==========

    pub async fn get_network_user(&self, id: i64) -> Result<Option<NetworkUser>> {
        NetworkUserRepo::get(&self.pool, id).await
    }

    pub async fn get_network_user_by_customer(&self, customer_id: i64) -> Result<Option<NetworkUser>> {
        NetworkUserRepo::get_by_customer(&self.pool, customer_id).await
    }

    pub async fn list_network_users(&self, scope: &TenantScope) -> Result<Vec<NetworkUser>> {
        NetworkUserRepo::list(&self.pool, scope).await
    }

    pub async fn list_network_users_by_router(&self, router_id: i64) -> Result<Vec<NetworkUser>> {
        NetworkUserRepo::list_by_router(&self.pool, router_id).await
    }

    pub async fn upsert_provisioned_user(&self, tenant_id: Option<i64>, user: &ProvisionedUser) -> Result<NetworkUser> {
        NetworkUserRepo::upsert_provisioned(&self.pool, tenant_id, user).await
    }

    pub async fn mark_network_user_deprovisioned(&self, id: i64, clear_allocation: bool) -> Result<()> {
        NetworkUserRepo::mark_deprovisioned(&self.pool, id, clear_allocation).await
    }

    pub async fn set_network_user_error(&self, customer_id: i64, error: &str) -> Result<()> {
        NetworkUserRepo::set_error(&self.pool, customer_id, error).await
    }

    // ========== OLT Operations ==========

    pub async fn list_olts(&self, scope: &TenantScope) -> Result<Vec<Olt>> {
        OltRepo::list(&self.pool, scope).await
    }

    pub async fn get_olt(&self, id: i64) -> Result<Option<Olt>> {
        OltRepo::get(&self.pool, id).await
    }

    pub async fn create_olt(&self, tenant_id: Option<i64>, req: &CreateOltRequest, vendor: &str) -> Result<Olt> {
        OltRepo::create(&self.pool, tenant_id, req, vendor).await
    }

    pub async fn update_olt_status(&self, id: i64, status: &str) -> Result<()> {
        OltRepo::update_status(&self.pool, id, status).await
    }

    pub async fn update_olt_health(&self, id: i64, health: &DeviceHealth) -> Result<()> {
        OltRepo::update_health(&self.pool, id, health).await
    }

    pub async fn touch_olt_sync(&self, id: i64) -> Result<()> {
        OltRepo::touch_sync(&self.pool, id).await
    }

    pub async fn create_olt_backup(&self, olt_id: i64, filename: &str, size: i64) -> Result<OltBackup> {
        OltRepo::create_backup(&self.pool, olt_id, filename, size).await
    }

    pub async fn get_olt_backup(&self, id: i64) -> Result<Option<OltBackup>> {
        OltRepo::get_backup(&self.pool, id).await
    }

    pub async fn list_olt_backups(&self, olt_id: i64) -> Result<Vec<OltBackup>> {
        OltRepo::list_backups(&self.pool, olt_id).await
    }

    pub async fn record_olt_config_apply(&self, olt_id: i64, commands: &[String], result: &ConfigApplyResult) -> Result<()> {
        OltRepo::record_config_apply(&self.pool, olt_id, commands, result).await
    }

    // ========== ONU Operations ==========

    pub async fn list_onus(&self, olt_id: i64) -> Result<Vec<Onu>> {
        OnuRepo::list_by_olt(&self.pool, olt_id).await
    }

    pub async fn get_onu(&self, id: i64) -> Result<Option<Onu>> {
        OnuRepo::get(&self.pool, id).await
    }

    pub async fn update_onu_status(
        &self,
        id: i64,
        status: &str,
        signal_rx: Option<f64>,
        signal_tx: Option<f64>,
        distance: Option<i64>,
    ) -> Result<Onu> {
        OnuRepo::update_status(&self.pool, id, status, signal_rx, signal_tx, distance).await
    }

    pub async fn set_onu_auth_state(&self, id: i64, auth_state: &str) -> Result<()> {
        OnuRepo::set_auth_state(&self.pool, id, auth_state).await
    }

    pub async fn link_onu_network_user(&self, id: i64, network_user_id: Option<i64>) -> Result<Onu> {
        OnuRepo::link_network_user(&self.pool, id, network_user_id).await
    }

    pub async fn onu_counts(&self, olt_id: i64) -> Result<OnuCounts> {
        OnuRepo::counts(&self.pool, olt_id).await
    }

    // ========== Monitoring Operations ==========

    pub async fn get_monitor(&self, device_type: &str, device_id: i64) -> Result<Option<DeviceMonitor>> {
        MonitorRepo::get(&self.pool, device_type, device_id).await
    }

    pub async fn list_monitors(&self) -> Result<Vec<DeviceMonitor>> {
        MonitorRepo::list(&self.pool).await
    }

    pub async fn record_monitor_success(
        &self,
        device_type: &str,
        device_id: i64,
        status: &str,
        health: &DeviceHealth,
    ) -> Result<DeviceMonitor> {
        MonitorRepo::record_success(&self.pool, device_type, device_id, status, health).await
    }

    pub async fn record_monitor_failure(
        &self,
        device_type: &str,
        device_id: i64,
        error: &str,
        threshold: i64,
    ) -> Result<DeviceMonitor> {
        MonitorRepo::record_failure(&self.pool, device_type, device_id, error, threshold).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_bandwidth(
        &self,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        period_start: DateTime<Utc>,
        upload_bytes: i64,
        download_bytes: i64,
        samples: i64,
    ) -> Result<()> {
        MonitorRepo::insert_bandwidth(
            &self.pool,
            device_type,
            device_id,
            period_type,
            period_start,
            upload_bytes,
            download_bytes,
            samples,
        )
        .await
    }

    pub async fn bandwidth_rows_before(&self, period_type: &str, before: DateTime<Utc>) -> Result<Vec<BandwidthRow>> {
        MonitorRepo::bandwidth_rows_before(&self.pool, period_type, before).await
    }

    pub async fn merge_bandwidth_bucket(
        &self,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        period_start: DateTime<Utc>,
        sources: &[BandwidthRow],
    ) -> Result<()> {
        MonitorRepo::merge_bucket(&self.pool, device_type, device_id, period_type, period_start, sources).await
    }

    pub async fn bandwidth_points(
        &self,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BandwidthPoint>> {
        MonitorRepo::bandwidth_points(&self.pool, device_type, device_id, period_type, from, to).await
    }
}

/// Single-connection in-memory stores for tests
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn memory_store() -> Store {
        Store::with_pool_size(":memory:", 1).await.unwrap()
    }

    pub async fn memory_radius() -> RadiusStore {
        RadiusStore::with_pool_size(":memory:", 1).await.unwrap()
    }
}
