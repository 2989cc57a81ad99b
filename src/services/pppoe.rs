//! PPPoE provisioning across router, RADIUS and the local database.
//!
//! Steps run strictly in order: profile, ip, connect, router_write,
//! radius_write, persist. The local record only flips to `provisioned` once
//! both remote writes are confirmed, and an address claimed by a failed run
//! is released before the error is returned.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::comment::{self, CommentInput};
use super::ipam::IpamService;
use super::radius::RadiusSync;
use crate::db::Store;
use crate::error::{NetError, NetResult, ProvisionError, ProvisionStep};
use crate::models::*;
use crate::protocols::{
    ActiveSession, FirewallRule, FirewallRuleAttributes, PppProfile, PppSecret, RouterApi, RouterConnector,
    SimpleQueue, SimpleQueueAttributes, SystemResource,
};

#[derive(Debug, Clone, Copy)]
pub struct PppoeSettings {
    /// Budget for the device-facing part of one provisioning item
    pub item_timeout: Duration,
    /// Budget for a whole bulk run; unprocessed items are reported as skipped
    pub batch_timeout: Duration,
}

/// What a provisioning run resolved before touching any device
struct ProvisionPlan {
    customer: Customer,
    profile: String,
    mapping: Option<PackageProfileMapping>,
    existing: Option<NetworkUser>,
}

/// An address claimed for one run, released again if the run fails
struct AllocationGuard {
    allocation: Option<IpAllocation>,
    fresh: bool,
}

impl AllocationGuard {
    fn none() -> Self {
        Self {
            allocation: None,
            fresh: false,
        }
    }

    fn address(&self) -> Option<String> {
        self.allocation.as_ref().map(|a| a.address.clone())
    }

    fn id(&self) -> Option<i64> {
        self.allocation.as_ref().map(|a| a.id)
    }

    async fn rollback(self, ipam: &IpamService, scope: &TenantScope) {
        let Some(allocation) = self.allocation else {
            return;
        };
        if !self.fresh {
            return;
        }
        match ipam.release_ip(scope, allocation.id).await {
            Ok(_) => tracing::info!("Rolled back allocation of {} for {}", allocation.address, allocation.username),
            Err(e) => tracing::error!("Failed to roll back allocation {}: {}", allocation.id, e),
        }
    }
}

/// Deterministic locally-administered MAC for customers without one on file
fn placeholder_mac(customer_id: i64) -> String {
    let b = (customer_id as u32).to_be_bytes();
    format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3])
}

/// Step an in-flight item has reached, so a timeout can name where it stopped
struct StepTracker(std::sync::Mutex<ProvisionStep>);

impl StepTracker {
    fn new(step: ProvisionStep) -> Self {
        StepTracker(std::sync::Mutex::new(step))
    }

    fn enter(&self, step: ProvisionStep) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = step;
    }

    fn current(&self) -> ProvisionStep {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn router_key(router_id: i64) -> String {
    format!("router:{}", router_id)
}

fn failed_item(customer_id: i64, err: &ProvisionError) -> BulkItemResult {
    BulkItemResult {
        customer_id,
        success: false,
        status: bulk_status::FAILED.to_string(),
        step: Some(err.step.to_string()),
        kind: Some(err.source.kind().to_string()),
        error: Some(err.source.to_string()),
    }
}

fn skipped_item(customer_id: i64, reason: &str) -> BulkItemResult {
    BulkItemResult {
        customer_id,
        success: false,
        status: bulk_status::SKIPPED.to_string(),
        step: None,
        kind: None,
        error: Some(reason.to_string()),
    }
}

/// Provisioning orchestrator plus pass-through router management
#[derive(Clone)]
pub struct PppoeService {
    store: Store,
    ipam: IpamService,
    radius: Arc<dyn RadiusSync>,
    connector: Arc<dyn RouterConnector>,
    locks: crate::utils::KeyedLocks,
    settings: PppoeSettings,
}

impl PppoeService {
    pub fn new(
        store: Store,
        ipam: IpamService,
        radius: Arc<dyn RadiusSync>,
        connector: Arc<dyn RouterConnector>,
        settings: PppoeSettings,
    ) -> Self {
        Self {
            store,
            ipam,
            radius,
            connector,
            locks: crate::utils::KeyedLocks::new(),
            settings,
        }
    }

    pub async fn get_router(&self, scope: &TenantScope, router_id: i64) -> NetResult<Router> {
        match self.store.get_router(router_id).await? {
            Some(router) if scope.allows(router.tenant_id) => Ok(router),
            _ => Err(NetError::not_found("Router", router_id)),
        }
    }

    // ========== Descriptors ==========

    pub async fn list_routers(&self, scope: &TenantScope) -> NetResult<Vec<Router>> {
        Ok(self.store.list_routers(scope).await?)
    }

    pub async fn create_router(&self, scope: &TenantScope, req: &CreateRouterRequest) -> NetResult<Router> {
        if req.name.trim().is_empty() || req.username.trim().is_empty() {
            return Err(NetError::invalid("router name and username are required"));
        }
        if !crate::utils::is_valid_ipv4(&req.host) {
            return Err(NetError::invalid(format!("invalid router host {:?}", req.host)));
        }
        let router = self.store.create_router(scope.tenant_id, req).await?;
        tracing::info!("Registered router {} ({}:{})", router.name, router.host, router.api_port);
        Ok(router)
    }

    pub async fn delete_router(&self, scope: &TenantScope, router_id: i64) -> NetResult<()> {
        let router = self.get_router(scope, router_id).await?;
        Ok(self.store.delete_router(router.id).await?)
    }

    pub async fn list_customers(&self, scope: &TenantScope) -> NetResult<Vec<Customer>> {
        Ok(self.store.list_customers(scope).await?)
    }

    /// Mirror a billing-side customer; the id is the billing system's
    pub async fn upsert_customer(&self, scope: &TenantScope, req: &UpsertCustomerRequest) -> NetResult<Customer> {
        if req.id <= 0 || req.username.trim().is_empty() {
            return Err(NetError::invalid("customer id and username are required"));
        }
        if let Some(mac) = req.mac_address.as_deref().filter(|m| !m.is_empty()) {
            if !crate::utils::is_valid_mac(mac) {
                return Err(NetError::invalid(format!("invalid MAC address {:?}", mac)));
            }
        }
        if let Some(existing) = self.store.get_customer(req.id).await? {
            if !scope.allows(existing.tenant_id) {
                return Err(NetError::not_found("Customer", req.id));
            }
        }
        Ok(self.store.upsert_customer(scope.tenant_id, req).await?)
    }

    pub async fn list_network_users(&self, scope: &TenantScope) -> NetResult<Vec<NetworkUser>> {
        Ok(self.store.list_network_users(scope).await?)
    }

    pub async fn list_package_mappings(&self, scope: &TenantScope) -> NetResult<Vec<PackageProfileMapping>> {
        Ok(self.store.list_package_mappings(scope).await?)
    }

    pub async fn create_package_mapping(
        &self,
        scope: &TenantScope,
        req: &CreatePackageMappingRequest,
    ) -> NetResult<PackageProfileMapping> {
        if req.profile_name.trim().is_empty() {
            return Err(NetError::invalid("profile name is required"));
        }
        self.get_router(scope, req.router_id).await?;
        if let Some(pool_id) = req.ip_pool_id {
            self.ipam.get_pool(scope, pool_id).await?;
        }
        Ok(self.store.create_package_mapping(scope.tenant_id, req).await?)
    }

    pub async fn delete_package_mapping(&self, scope: &TenantScope, mapping_id: i64) -> NetResult<()> {
        let visible = self.list_package_mappings(scope).await?;
        if !visible.iter().any(|m| m.id == mapping_id) {
            return Err(NetError::not_found("Package mapping", mapping_id));
        }
        Ok(self.store.delete_package_mapping(mapping_id).await?)
    }

    async fn connect(&self, router: &Router) -> NetResult<Box<dyn RouterApi>> {
        match tokio::time::timeout(self.settings.item_timeout, self.connector.connect(router)).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                operation: format!("connect to router {}", router.name),
                secs: self.settings.item_timeout.as_secs(),
            }),
        }
    }

    // ========== Provisioning ==========

    /// Provision (or re-provision) one customer on a router
    pub async fn provision(&self, scope: &TenantScope, req: &ProvisionRequest) -> Result<NetworkUser, ProvisionError> {
        let router = self
            .get_router(scope, req.router_id)
            .await
            .map_err(ProvisionError::at(ProvisionStep::Connect))?;
        let _guard = self.locks.lock(&router_key(router.id)).await;

        let result = async {
            let plan = self.plan(scope, &router, req.customer_id, req.profile.as_deref()).await?;
            let allocation = self.resolve_ip(scope, &plan, req.static_ip.as_deref()).await?;
            let steps = StepTracker::new(ProvisionStep::Connect);
            let outcome = self
                .bounded_item(&steps, async {
                    let mut api = self
                        .connect(&router)
                        .await
                        .map_err(ProvisionError::at(ProvisionStep::Connect))?;
                    self.apply(scope, api.as_mut(), &router, &plan, &allocation, &steps).await
                })
                .await;
            self.finish(scope, &plan, allocation, outcome).await
        }
        .await;

        if let Err(e) = &result {
            self.record_failure(req.customer_id, e).await;
        }
        result
    }

    /// Provision many customers over one router connection.
    /// A connect failure fails the batch; everything else is reported per item.
    pub async fn bulk_provision(
        &self,
        scope: &TenantScope,
        req: &BulkProvisionRequest,
    ) -> Result<Vec<BulkItemResult>, ProvisionError> {
        let router = self
            .get_router(scope, req.router_id)
            .await
            .map_err(ProvisionError::at(ProvisionStep::Connect))?;
        let _guard = self.locks.lock(&router_key(router.id)).await;
        let deadline = Instant::now() + self.settings.batch_timeout;

        let mut api = self
            .connect(&router)
            .await
            .map_err(ProvisionError::at(ProvisionStep::Connect))?;
        tracing::info!(
            "Bulk provisioning {} customers on router {}",
            req.customer_ids.len(),
            router.name
        );

        let mut results = Vec::with_capacity(req.customer_ids.len());
        let mut connection_lost = false;
        for &customer_id in &req.customer_ids {
            if connection_lost {
                results.push(skipped_item(customer_id, "router connection lost"));
                continue;
            }
            if Instant::now() >= deadline {
                results.push(skipped_item(customer_id, "batch deadline exceeded"));
                continue;
            }

            match self.provision_item(scope, api.as_mut(), &router, customer_id).await {
                Ok(user) => {
                    tracing::debug!("Customer {} provisioned as {}", customer_id, user.username);
                    results.push(BulkItemResult {
                        customer_id,
                        success: true,
                        status: bulk_status::SUCCEEDED.to_string(),
                        step: None,
                        kind: None,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!("Bulk provisioning of customer {} failed at {}: {}", customer_id, e.step, e.source);
                    self.record_failure(customer_id, &e).await;
                    results.push(failed_item(customer_id, &e));
                    // A timed out item leaves the API session mid-exchange
                    if matches!(e.source, NetError::Timeout { .. }) {
                        match self.connect(&router).await {
                            Ok(fresh) => api = fresh,
                            Err(err) => {
                                tracing::warn!("Reconnect to router {} failed: {}", router.name, err);
                                connection_lost = true;
                            }
                        }
                    }
                }
            }
        }
        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Bulk provisioning on router {} finished: {}/{} succeeded",
            router.name,
            succeeded,
            results.len()
        );
        Ok(results)
    }

    async fn provision_item(
        &self,
        scope: &TenantScope,
        api: &mut dyn RouterApi,
        router: &Router,
        customer_id: i64,
    ) -> Result<NetworkUser, ProvisionError> {
        let plan = self.plan(scope, router, customer_id, None).await?;
        let allocation = self.resolve_ip(scope, &plan, None).await?;
        let steps = StepTracker::new(ProvisionStep::RouterWrite);
        let outcome = self
            .bounded_item(&steps, self.apply(scope, api, router, &plan, &allocation, &steps))
            .await;
        self.finish(scope, &plan, allocation, outcome).await
    }

    async fn bounded_item<F>(&self, steps: &StepTracker, fut: F) -> Result<NetworkUser, ProvisionError>
    where
        F: std::future::Future<Output = Result<NetworkUser, ProvisionError>>,
    {
        match tokio::time::timeout(self.settings.item_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError {
                step: steps.current(),
                source: NetError::Timeout {
                    operation: "provisioning".to_string(),
                    secs: self.settings.item_timeout.as_secs(),
                },
            }),
        }
    }

    /// Release a fresh address on failure; retire a superseded one on success
    async fn finish(
        &self,
        scope: &TenantScope,
        plan: &ProvisionPlan,
        allocation: AllocationGuard,
        outcome: Result<NetworkUser, ProvisionError>,
    ) -> Result<NetworkUser, ProvisionError> {
        match outcome {
            Ok(user) => {
                let previous = plan.existing.as_ref().and_then(|u| u.allocation_id);
                if let Some(old) = previous.filter(|old| Some(*old) != allocation.id()) {
                    if let Err(e) = self.ipam.release_ip(scope, old).await {
                        tracing::warn!("Could not release superseded allocation {}: {}", old, e);
                    }
                }
                Ok(user)
            }
            Err(e) => {
                allocation.rollback(&self.ipam, scope).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, customer_id: i64, err: &ProvisionError) {
        if let Err(e) = self.store.set_network_user_error(customer_id, &err.to_string()).await {
            tracing::warn!("Could not record provisioning error for customer {}: {}", customer_id, e);
        }
    }

    /// Step 1: customer, existing record and router-side profile
    async fn plan(
        &self,
        scope: &TenantScope,
        router: &Router,
        customer_id: i64,
        profile_override: Option<&str>,
    ) -> Result<ProvisionPlan, ProvisionError> {
        let step = ProvisionError::at;
        let customer = match self.store.get_customer(customer_id).await {
            Ok(Some(c)) if scope.allows(c.tenant_id) => c,
            Ok(_) => return Err(step(ProvisionStep::Profile)(NetError::not_found("Customer", customer_id))),
            Err(e) => return Err(step(ProvisionStep::Profile)(e.into())),
        };
        if customer.username.trim().is_empty() || customer.password.is_empty() {
            return Err(step(ProvisionStep::Profile)(NetError::invalid(format!(
                "customer {} has no PPPoE credentials",
                customer_id
            ))));
        }

        let mapping = match customer.package_id {
            Some(package_id) => self
                .store
                .find_package_mapping(package_id, router.id)
                .await
                .map_err(|e| step(ProvisionStep::Profile)(e.into()))?,
            None => None,
        };
        let profile = match (profile_override.filter(|p| !p.trim().is_empty()), &mapping) {
            (Some(p), _) => p.trim().to_string(),
            (None, Some(m)) => m.profile_name.clone(),
            (None, None) => {
                return Err(step(ProvisionStep::Profile)(NetError::NoProfileMapping {
                    package_id: customer.package_id.unwrap_or_default(),
                    router_id: router.id,
                }))
            }
        };
        let existing = self
            .store
            .get_network_user_by_customer(customer_id)
            .await
            .map_err(|e| step(ProvisionStep::Profile)(e.into()))?;

        Ok(ProvisionPlan {
            customer,
            profile,
            mapping,
            existing,
        })
    }

    /// Step 2: a static address must sit in the mapped pool; otherwise allocate from it
    async fn resolve_ip(
        &self,
        scope: &TenantScope,
        plan: &ProvisionPlan,
        static_ip: Option<&str>,
    ) -> Result<AllocationGuard, ProvisionError> {
        let at_ip = ProvisionError::at(ProvisionStep::Ip);
        let pool_id = plan.mapping.as_ref().and_then(|m| m.ip_pool_id);
        let mac = plan
            .customer
            .mac_address
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| placeholder_mac(plan.customer.id));
        let username = plan.customer.username.as_str();

        let allocation = match (static_ip.filter(|s| !s.is_empty()), pool_id) {
            (Some(address), Some(pool_id)) => self
                .ipam
                .claim_address(scope, pool_id, address, &mac, username, allocation_status::ACTIVE)
                .await
                .map_err(at_ip)?,
            (Some(address), None) => {
                return Err(at_ip(NetError::invalid(format!(
                    "static IP {} requested but no pool is mapped for this package and router",
                    address
                ))))
            }
            (None, Some(pool_id)) => self
                .ipam
                .allocate_ip(scope, pool_id, &mac, username)
                .await
                .map_err(at_ip)?,
            (None, None) => return Ok(AllocationGuard::none()),
        };
        let fresh = plan.existing.as_ref().and_then(|u| u.allocation_id) != Some(allocation.id);
        Ok(AllocationGuard {
            allocation: Some(allocation),
            fresh,
        })
    }

    /// Steps 4-6 over an open router session
    async fn apply(
        &self,
        scope: &TenantScope,
        api: &mut dyn RouterApi,
        router: &Router,
        plan: &ProvisionPlan,
        allocation: &AllocationGuard,
        steps: &StepTracker,
    ) -> Result<NetworkUser, ProvisionError> {
        let customer = &plan.customer;
        let router_comment = comment::encode(&CommentInput {
            username: &customer.username,
            user_id: customer.id,
            package_id: customer.package_id,
            expiry_date: customer.expiry_date,
            service_type: Some(service_type::PPPOE),
        });
        let attrs = PppoeUserAttributes {
            name: customer.username.clone(),
            password: customer.password.clone(),
            profile: plan.profile.clone(),
            service: service_type::PPPOE.to_string(),
            remote_address: allocation.address(),
            caller_id: None,
            comment: router_comment.clone(),
            disabled: false,
        };

        steps.enter(ProvisionStep::RouterWrite);
        write_secret(api, &attrs)
            .await
            .map_err(ProvisionError::at(ProvisionStep::RouterWrite))?;
        tracing::info!("PPPoE secret {} written to router {}", attrs.name, router.name);

        let radius_user = RadiusUserAttributes {
            username: customer.username.clone(),
            password: customer.password.clone(),
            profile: Some(plan.profile.clone()),
            framed_ip: allocation.address(),
            rate_limit: plan.mapping.as_ref().and_then(|m| m.rate_limit.clone()),
            session_timeout: None,
            disabled: false,
        };
        steps.enter(ProvisionStep::RadiusWrite);
        self.radius.upsert_user(&radius_user).await.map_err(|e| ProvisionError {
            step: ProvisionStep::RadiusWrite,
            source: NetError::PartialFailure {
                step: ProvisionStep::RadiusWrite.to_string(),
                message: format!("router secret written but RADIUS sync failed: {}", e),
            },
        })?;

        let record = ProvisionedUser {
            customer_id: customer.id,
            router_id: router.id,
            username: customer.username.clone(),
            password: customer.password.clone(),
            profile: plan.profile.clone(),
            service_type: service_type::PPPOE.to_string(),
            static_ip: allocation.address(),
            allocation_id: allocation.id(),
            package_id: customer.package_id,
            expiry_date: customer.expiry_date,
            router_comment,
        };
        let tenant_id = scope.tenant_id.or(router.tenant_id);
        steps.enter(ProvisionStep::Persist);
        let user = self
            .store
            .upsert_provisioned_user(tenant_id, &record)
            .await
            .map_err(|e| ProvisionError {
                step: ProvisionStep::Persist,
                source: NetError::PartialFailure {
                    step: ProvisionStep::Persist.to_string(),
                    message: format!("router and RADIUS written but local record failed: {:#}", e),
                },
            })?;
        tracing::info!("Customer {} provisioned as {} on router {}", customer.id, user.username, router.name);
        Ok(user)
    }

    // ========== Deprovisioning ==========

    /// Disconnect, then disable (or delete and release the address) on router and RADIUS
    pub async fn deprovision(&self, scope: &TenantScope, req: &DeprovisionRequest) -> Result<NetworkUser, ProvisionError> {
        let at_connect = ProvisionError::at(ProvisionStep::Connect);
        let router = self.get_router(scope, req.router_id).await.map_err(at_connect)?;
        let user = match self.store.get_network_user_by_customer(req.customer_id).await {
            Ok(Some(u)) if scope.allows(u.tenant_id) => u,
            Ok(_) => {
                return Err(ProvisionError::at(ProvisionStep::Profile)(NetError::not_found(
                    "Network user",
                    req.customer_id,
                )))
            }
            Err(e) => return Err(ProvisionError::at(ProvisionStep::Profile)(e.into())),
        };
        let _guard = self.locks.lock(&router_key(router.id)).await;

        let timeout = self.settings.item_timeout;
        let device_steps = async {
            let mut api = self
                .connect(&router)
                .await
                .map_err(ProvisionError::at(ProvisionStep::Connect))?;
            let at_write = ProvisionError::at(ProvisionStep::RouterWrite);
            for session in api.active_sessions(Some(&user.username)).await.map_err(at_write)? {
                api.remove_active_session(&session.id)
                    .await
                    .map_err(ProvisionError::at(ProvisionStep::RouterWrite))?;
                tracing::info!("Disconnected active session of {} on router {}", user.username, router.name);
            }
            let secret = api
                .find_secret(&user.username)
                .await
                .map_err(ProvisionError::at(ProvisionStep::RouterWrite))?;
            let outcome = match secret {
                Some(secret) if req.delete => api.remove_secret(&secret.id).await,
                Some(secret) => api.set_secret_disabled(&secret.id, true).await,
                None => {
                    tracing::warn!("PPPoE secret {} not present on router {}", user.username, router.name);
                    Ok(())
                }
            };
            outcome.map_err(ProvisionError::at(ProvisionStep::RouterWrite))
        };
        match tokio::time::timeout(timeout, device_steps).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProvisionError {
                    step: ProvisionStep::RouterWrite,
                    source: NetError::Timeout {
                        operation: "deprovisioning".to_string(),
                        secs: timeout.as_secs(),
                    },
                })
            }
        }

        let radius_result = if req.delete {
            self.radius.delete_user(&user.username).await.map(|_| ())
        } else {
            self.radius.set_user_disabled(&user.username, true).await
        };
        radius_result.map_err(|e| ProvisionError {
            step: ProvisionStep::RadiusWrite,
            source: NetError::PartialFailure {
                step: ProvisionStep::RadiusWrite.to_string(),
                message: format!("router updated but RADIUS sync failed: {}", e),
            },
        })?;

        if req.delete {
            if let Some(allocation_id) = user.allocation_id {
                self.ipam
                    .release_ip(scope, allocation_id)
                    .await
                    .map_err(ProvisionError::at(ProvisionStep::Ip))?;
            }
        }
        let at_persist = ProvisionError::at(ProvisionStep::Persist);
        self.store
            .mark_network_user_deprovisioned(user.id, req.delete)
            .await
            .map_err(|e| at_persist(e.into()))?;
        tracing::info!(
            "Customer {} deprovisioned on router {} ({})",
            req.customer_id,
            router.name,
            if req.delete { "deleted" } else { "disabled" }
        );
        self.store
            .get_network_user(user.id)
            .await
            .map_err(|e| ProvisionError::at(ProvisionStep::Persist)(e.into()))?
            .ok_or_else(|| ProvisionError::at(ProvisionStep::Persist)(NetError::not_found("Network user", user.id)))
    }

    // ========== Reconciliation ==========

    /// Compare router secrets against local records. Reports only, never corrects.
    pub async fn reconcile_router(&self, scope: &TenantScope, router_id: i64) -> NetResult<ReconciliationReport> {
        let router = self.get_router(scope, router_id).await?;
        let secrets = self
            .with_router(&router, |api| Box::pin(async move { api.list_secrets().await }))
            .await?;
        let locals = self.store.list_network_users_by_router(router.id).await?;
        Ok(build_report(router.id, &secrets, &locals))
    }

    // ========== Router Operations ==========

    async fn with_router<T, F>(&self, router: &Router, op: F) -> NetResult<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut dyn RouterApi) -> BoxFuture<'a, NetResult<T>> + Send,
    {
        let _guard = self.locks.lock(&router_key(router.id)).await;
        let work = async {
            let mut api = self.connector.connect(router).await?;
            op(api.as_mut()).await
        };
        match tokio::time::timeout(self.settings.item_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                operation: format!("router {}", router.name),
                secs: self.settings.item_timeout.as_secs(),
            }),
        }
    }

    pub async fn test_router(&self, scope: &TenantScope, router_id: i64) -> NetResult<ConnectionTest> {
        let router = self.get_router(scope, router_id).await?;
        let started = std::time::Instant::now();
        let outcome = self
            .with_router(&router, |api| Box::pin(async move { api.identity().await }))
            .await;
        let status = if outcome.is_ok() { device_status::ONLINE } else { device_status::OFFLINE };
        self.store.update_router_status(router.id, status).await?;
        Ok(match outcome {
            Ok(identity) => ConnectionTest {
                success: true,
                message: format!("connected to {}", identity),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => ConnectionTest {
                success: false,
                message: e.to_string(),
                latency_ms: None,
            },
        })
    }

    pub async fn system_resource(&self, scope: &TenantScope, router_id: i64) -> NetResult<SystemResource> {
        let router = self.get_router(scope, router_id).await?;
        self.with_router(&router, |api| Box::pin(async move { api.system_resource().await }))
            .await
    }

    pub async fn list_secrets(&self, scope: &TenantScope, router_id: i64) -> NetResult<Vec<PppSecret>> {
        let router = self.get_router(scope, router_id).await?;
        self.with_router(&router, |api| Box::pin(async move { api.list_secrets().await }))
            .await
    }

    pub async fn active_sessions(&self, scope: &TenantScope, router_id: i64) -> NetResult<Vec<ActiveSession>> {
        let router = self.get_router(scope, router_id).await?;
        self.with_router(&router, |api| Box::pin(async move { api.active_sessions(None).await }))
            .await
    }

    pub async fn disconnect_session(&self, scope: &TenantScope, router_id: i64, session_id: &str) -> NetResult<()> {
        let router = self.get_router(scope, router_id).await?;
        let id = session_id.to_string();
        self.with_router(&router, move |api| Box::pin(async move { api.remove_active_session(&id).await }))
            .await?;
        tracing::info!("Disconnected session {} on router {}", session_id, router.name);
        Ok(())
    }

    pub async fn list_profiles(&self, scope: &TenantScope, router_id: i64) -> NetResult<Vec<PppProfile>> {
        let router = self.get_router(scope, router_id).await?;
        self.with_router(&router, |api| Box::pin(async move { api.list_profiles().await }))
            .await
    }

    /// Create the profile unless one with the same name exists
    pub async fn ensure_profile(
        &self,
        scope: &TenantScope,
        router_id: i64,
        attrs: &PppProfileAttributes,
    ) -> NetResult<PppProfile> {
        if attrs.name.trim().is_empty() {
            return Err(NetError::invalid("profile name is required"));
        }
        let router = self.get_router(scope, router_id).await?;
        let attrs = attrs.clone();
        self.with_router(&router, move |api| {
            Box::pin(async move {
                if let Some(existing) = api.find_profile(&attrs.name).await? {
                    return Ok(existing);
                }
                api.add_profile(&attrs).await?;
                api.find_profile(&attrs.name)
                    .await?
                    .ok_or_else(|| NetError::ReconciliationNeeded(format!("profile {} not visible after add", attrs.name)))
            })
        })
        .await
    }

    pub async fn list_queues(&self, scope: &TenantScope, router_id: i64) -> NetResult<Vec<SimpleQueue>> {
        let router = self.get_router(scope, router_id).await?;
        self.with_router(&router, |api| Box::pin(async move { api.list_queues().await }))
            .await
    }

    pub async fn add_queue(&self, scope: &TenantScope, router_id: i64, attrs: &SimpleQueueAttributes) -> NetResult<String> {
        if attrs.name.trim().is_empty() || attrs.target.trim().is_empty() {
            return Err(NetError::invalid("queue name and target are required"));
        }
        let router = self.get_router(scope, router_id).await?;
        let attrs = attrs.clone();
        self.with_router(&router, move |api| Box::pin(async move { api.add_queue(&attrs).await }))
            .await
    }

    pub async fn list_firewall_rules(
        &self,
        scope: &TenantScope,
        router_id: i64,
        chain: Option<&str>,
    ) -> NetResult<Vec<FirewallRule>> {
        let router = self.get_router(scope, router_id).await?;
        let chain = chain.map(str::to_string);
        self.with_router(&router, move |api| {
            Box::pin(async move { api.list_firewall_rules(chain.as_deref()).await })
        })
        .await
    }

    pub async fn add_firewall_rule(
        &self,
        scope: &TenantScope,
        router_id: i64,
        attrs: &FirewallRuleAttributes,
    ) -> NetResult<String> {
        if attrs.chain.trim().is_empty() || attrs.action.trim().is_empty() {
            return Err(NetError::invalid("firewall rule chain and action are required"));
        }
        let router = self.get_router(scope, router_id).await?;
        let attrs = attrs.clone();
        self.with_router(&router, move |api| Box::pin(async move { api.add_firewall_rule(&attrs).await }))
            .await
    }
}

/// Create or update the secret, then read it back. A secret that does not
/// carry what was written is a partial write and needs reconciliation.
async fn write_secret(api: &mut dyn RouterApi, attrs: &PppoeUserAttributes) -> NetResult<()> {
    match api.find_secret(&attrs.name).await? {
        Some(existing) => api.set_secret(&existing.id, attrs).await?,
        None => {
            api.add_secret(attrs).await?;
        }
    }
    let written = api.find_secret(&attrs.name).await?;
    match written {
        Some(secret) if secret.comment == attrs.comment && secret.profile == attrs.profile && !secret.disabled => Ok(()),
        Some(secret) => Err(NetError::ReconciliationNeeded(format!(
            "secret {} read back with comment {:?} profile {:?} disabled={}",
            secret.name, secret.comment, secret.profile, secret.disabled
        ))),
        None => Err(NetError::ReconciliationNeeded(format!(
            "secret {} missing after write",
            attrs.name
        ))),
    }
}

pub fn build_report(router_id: i64, secrets: &[PppSecret], locals: &[NetworkUser]) -> ReconciliationReport {
    let by_customer: HashMap<i64, &NetworkUser> = locals.iter().map(|u| (u.customer_id, u)).collect();
    let by_username: HashMap<&str, &PppSecret> = secrets.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut orphaned = Vec::new();
    let mut state_mismatch = Vec::new();
    for secret in secrets {
        let decoded = comment::decode(&secret.comment);
        let local = decoded.user_id().and_then(|id| by_customer.get(&id));
        match local {
            Some(user) => {
                let locally_active = user.state == network_user_state::PROVISIONED;
                if locally_active == secret.disabled {
                    state_mismatch.push(secret.name.clone());
                }
            }
            None => orphaned.push(OrphanedSecret {
                secret_name: secret.name.clone(),
                comment: secret.comment.clone(),
                decoded_user_id: Some(decoded.user_id).filter(|s| !s.is_empty()),
            }),
        }
    }

    let missing = locals
        .iter()
        .filter(|u| u.state == network_user_state::PROVISIONED && !by_username.contains_key(u.username.as_str()))
        .map(|u| u.username.clone())
        .collect();

    ReconciliationReport {
        router_id,
        checked: secrets.len(),
        orphaned,
        missing,
        state_mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_store;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRouterState {
        pub secrets: Vec<PppSecret>,
        pub sessions: Vec<ActiveSession>,
        pub profiles: Vec<PppProfile>,
        pub fail_secret_writes: bool,
        pub fail_connect: bool,
        pub hang_connect: bool,
        /// Secret writes for this name never complete
        pub hang_on: Option<String>,
        pub connects: usize,
        /// (connection number, secret name) per completed write
        pub writes: Vec<(usize, String)>,
        next_id: usize,
    }

    impl MockRouterState {
        fn next_id(&mut self) -> String {
            self.next_id += 1;
            format!("*{:X}", self.next_id)
        }
    }

    pub struct MockRouter {
        state: Arc<Mutex<MockRouterState>>,
        connection: usize,
    }

    impl MockRouter {
        async fn stall_if_hung(&self, name: &str) {
            let hung = self.state.lock().unwrap().hang_on.as_deref() == Some(name);
            if hung {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    #[async_trait]
    impl RouterApi for MockRouter {
        async fn identity(&mut self) -> NetResult<String> {
            Ok("mock-router".into())
        }

        async fn system_resource(&mut self) -> NetResult<SystemResource> {
            Ok(SystemResource {
                uptime: "1h".into(),
                version: "7.12".into(),
                board_name: "CCR".into(),
                cpu_load: Some(12.0),
                free_memory: Some(512),
                total_memory: Some(1024),
            })
        }

        async fn find_secret(&mut self, name: &str) -> NetResult<Option<PppSecret>> {
            let state = self.state.lock().unwrap();
            Ok(state.secrets.iter().find(|s| s.name == name).cloned())
        }

        async fn list_secrets(&mut self) -> NetResult<Vec<PppSecret>> {
            Ok(self.state.lock().unwrap().secrets.clone())
        }

        async fn add_secret(&mut self, attrs: &PppoeUserAttributes) -> NetResult<String> {
            self.stall_if_hung(&attrs.name).await;
            let mut state = self.state.lock().unwrap();
            if state.fail_secret_writes {
                return Err(NetError::DeviceRejected("failure: secret write refused".into()));
            }
            state.writes.push((self.connection, attrs.name.clone()));
            let id = state.next_id();
            state.secrets.push(PppSecret {
                id: id.clone(),
                name: attrs.name.clone(),
                password: attrs.password.clone(),
                profile: attrs.profile.clone(),
                service: attrs.service.clone(),
                remote_address: attrs.remote_address.clone(),
                caller_id: attrs.caller_id.clone(),
                comment: attrs.comment.clone(),
                disabled: attrs.disabled,
            });
            Ok(id)
        }

        async fn set_secret(&mut self, id: &str, attrs: &PppoeUserAttributes) -> NetResult<()> {
            self.stall_if_hung(&attrs.name).await;
            let mut state = self.state.lock().unwrap();
            if state.fail_secret_writes {
                return Err(NetError::DeviceRejected("failure: secret write refused".into()));
            }
            state.writes.push((self.connection, attrs.name.clone()));
            if let Some(secret) = state.secrets.iter_mut().find(|s| s.id == id) {
                secret.password = attrs.password.clone();
                secret.profile = attrs.profile.clone();
                secret.remote_address = attrs.remote_address.clone();
                secret.comment = attrs.comment.clone();
                secret.disabled = attrs.disabled;
            }
            Ok(())
        }

        async fn set_secret_disabled(&mut self, id: &str, disabled: bool) -> NetResult<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(secret) = state.secrets.iter_mut().find(|s| s.id == id) {
                secret.disabled = disabled;
            }
            Ok(())
        }

        async fn remove_secret(&mut self, id: &str) -> NetResult<()> {
            self.state.lock().unwrap().secrets.retain(|s| s.id != id);
            Ok(())
        }

        async fn active_sessions(&mut self, name: Option<&str>) -> NetResult<Vec<ActiveSession>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .sessions
                .iter()
                .filter(|s| name.map_or(true, |n| s.name == n))
                .cloned()
                .collect())
        }

        async fn remove_active_session(&mut self, id: &str) -> NetResult<()> {
            self.state.lock().unwrap().sessions.retain(|s| s.id != id);
            Ok(())
        }

        async fn find_profile(&mut self, name: &str) -> NetResult<Option<PppProfile>> {
            let state = self.state.lock().unwrap();
            Ok(state.profiles.iter().find(|p| p.name == name).cloned())
        }

        async fn list_profiles(&mut self) -> NetResult<Vec<PppProfile>> {
            Ok(self.state.lock().unwrap().profiles.clone())
        }

        async fn add_profile(&mut self, attrs: &PppProfileAttributes) -> NetResult<String> {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id();
            state.profiles.push(PppProfile {
                id: id.clone(),
                name: attrs.name.clone(),
                local_address: attrs.local_address.clone(),
                remote_address: attrs.remote_address.clone(),
                rate_limit: attrs.rate_limit.clone(),
            });
            Ok(id)
        }

        async fn list_queues(&mut self) -> NetResult<Vec<SimpleQueue>> {
            Ok(Vec::new())
        }

        async fn add_queue(&mut self, _attrs: &SimpleQueueAttributes) -> NetResult<String> {
            Ok(self.state.lock().unwrap().next_id())
        }

        async fn list_firewall_rules(&mut self, _chain: Option<&str>) -> NetResult<Vec<FirewallRule>> {
            Ok(Vec::new())
        }

        async fn add_firewall_rule(&mut self, _attrs: &FirewallRuleAttributes) -> NetResult<String> {
            Ok(self.state.lock().unwrap().next_id())
        }
    }

    #[derive(Default, Clone)]
    pub struct MockConnector {
        pub state: Arc<Mutex<MockRouterState>>,
    }

    #[async_trait]
    impl RouterConnector for MockConnector {
        async fn connect(&self, _router: &Router) -> NetResult<Box<dyn RouterApi>> {
            let hang = self.state.lock().unwrap().hang_connect;
            if hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let connection = {
                let mut state = self.state.lock().unwrap();
                if state.fail_connect {
                    return Err(NetError::DeviceUnreachable("connection refused".into()));
                }
                state.connects += 1;
                state.connects
            };
            Ok(Box::new(MockRouter {
                state: self.state.clone(),
                connection,
            }))
        }
    }

    #[derive(Default)]
    pub struct MockRadius {
        pub users: Mutex<HashMap<String, RadiusUserAttributes>>,
        pub fail: Mutex<bool>,
    }

    #[async_trait]
    impl RadiusSync for MockRadius {
        async fn upsert_user(&self, attrs: &RadiusUserAttributes) -> NetResult<()> {
            if *self.fail.lock().unwrap() {
                return Err(NetError::Storage("radius database locked".into()));
            }
            self.users.lock().unwrap().insert(attrs.username.clone(), attrs.clone());
            Ok(())
        }

        async fn set_user_disabled(&self, username: &str, disabled: bool) -> NetResult<()> {
            if let Some(user) = self.users.lock().unwrap().get_mut(username) {
                user.disabled = disabled;
            }
            Ok(())
        }

        async fn delete_user(&self, username: &str) -> NetResult<bool> {
            Ok(self.users.lock().unwrap().remove(username).is_some())
        }
    }

    struct Fixture {
        store: Store,
        ipam: IpamService,
        service: PppoeService,
        router_state: Arc<Mutex<MockRouterState>>,
        radius: Arc<MockRadius>,
        router: Router,
        pool: IpPool,
    }

    async fn fixture() -> Fixture {
        let store = memory_store().await;
        let ipam = IpamService::new(store.clone());
        let connector = MockConnector::default();
        let router_state = connector.state.clone();
        let radius = Arc::new(MockRadius::default());
        let service = PppoeService::new(
            store.clone(),
            ipam.clone(),
            radius.clone(),
            Arc::new(connector),
            PppoeSettings {
                item_timeout: Duration::from_secs(5),
                batch_timeout: Duration::from_secs(60),
            },
        );
        let router = store
            .create_router(
                None,
                &CreateRouterRequest {
                    name: "core-1".into(),
                    host: "10.0.0.1".into(),
                    api_port: 8728,
                    username: "admin".into(),
                    password: "secret".into(),
                    vendor: None,
                },
            )
            .await
            .unwrap();
        let pool = ipam
            .create_pool(
                &TenantScope::platform(),
                &CreateIpPoolRequest {
                    name: "pppoe".into(),
                    cidr: "100.64.0.0/28".into(),
                    gateway: Some("100.64.0.1".into()),
                    dns_primary: None,
                    dns_secondary: None,
                    range_start: None,
                    range_end: None,
                    description: None,
                    allow_shared_mac: false,
                },
            )
            .await
            .unwrap();
        store
            .create_package_mapping(
                None,
                &CreatePackageMappingRequest {
                    package_id: 10,
                    router_id: router.id,
                    profile_name: "10M".into(),
                    ip_pool_id: Some(pool.id),
                    speed_control_method: None,
                    rate_limit: Some("10M/10M".into()),
                },
            )
            .await
            .unwrap();
        Fixture {
            store,
            ipam,
            service,
            router_state,
            radius,
            router,
            pool,
        }
    }

    async fn add_customer(store: &Store, id: i64, package_id: Option<i64>) -> Customer {
        store
            .upsert_customer(
                None,
                &UpsertCustomerRequest {
                    id,
                    username: format!("user{}", id),
                    password: format!("pw{}", id),
                    mac_address: Some(format!("00:11:22:33:44:{:02x}", id)),
                    package_id,
                    expiry_date: chrono::NaiveDate::from_ymd_opt(2026, 12, 31),
                },
            )
            .await
            .unwrap()
    }

    fn provision_req(customer_id: i64, router_id: i64) -> ProvisionRequest {
        ProvisionRequest {
            customer_id,
            router_id,
            profile: None,
            static_ip: None,
        }
    }

    async fn live_allocations(ipam: &IpamService, pool_id: i64) -> usize {
        ipam.list_allocations(&TenantScope::platform(), pool_id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.status != allocation_status::RELEASED)
            .count()
    }

    #[tokio::test]
    async fn test_provision_writes_router_radius_and_record() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;

        let user = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap();
        assert_eq!(user.state, network_user_state::PROVISIONED);
        assert_eq!(user.profile, "10M");
        assert_eq!(user.static_ip.as_deref(), Some("100.64.0.2"));
        assert_eq!(user.router_comment, "user1|1|10|2026-12-31|pppoe");

        let secrets = f.router_state.lock().unwrap().secrets.clone();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].comment, user.router_comment);
        assert_eq!(secrets[0].remote_address.as_deref(), Some("100.64.0.2"));

        let radius_user = f.radius.users.lock().unwrap().get("user1").cloned().unwrap();
        assert_eq!(radius_user.rate_limit.as_deref(), Some("10M/10M"));
        assert_eq!(radius_user.framed_ip.as_deref(), Some("100.64.0.2"));
    }

    #[tokio::test]
    async fn test_reprovision_is_idempotent() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        let scope = TenantScope::platform();
        let first = f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        let second = f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        assert_eq!(first.allocation_id, second.allocation_id);
        assert_eq!(f.router_state.lock().unwrap().secrets.len(), 1);
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 1);
    }

    #[tokio::test]
    async fn test_router_write_failure_leaves_no_local_state() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        f.router_state.lock().unwrap().fail_secret_writes = true;

        let err = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::RouterWrite);
        assert_eq!(err.source.kind(), "device_rejected");
        assert!(f.store.get_network_user_by_customer(1).await.unwrap().is_none());
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 0);
        assert!(f.radius.users.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_releases_address() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        f.router_state.lock().unwrap().fail_connect = true;

        let err = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::Connect);
        assert!(err.source.is_unreachable());
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 0);
    }

    #[tokio::test]
    async fn test_radius_failure_is_partial_failure() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        *f.radius.fail.lock().unwrap() = true;

        let err = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::RadiusWrite);
        assert_eq!(err.source.kind(), "partial_failure");
        assert!(f.store.get_network_user_by_customer(1).await.unwrap().is_none());
        // The router secret stays behind for reconciliation
        assert_eq!(f.router_state.lock().unwrap().secrets.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_mapping_fails_at_profile_step() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(99)).await;
        let err = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::Profile);
        assert!(matches!(
            err.source,
            NetError::NoProfileMapping {
                package_id: 99,
                ..
            }
        ));
        assert_eq!(f.router_state.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_static_ip_must_be_in_mapped_pool() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        let scope = TenantScope::platform();
        let mut req = provision_req(1, f.router.id);
        req.static_ip = Some("192.168.1.10".into());
        let err = f.service.provision(&scope, &req).await.unwrap_err();
        assert_eq!(err.step, ProvisionStep::Ip);

        req.static_ip = Some("100.64.0.9".into());
        let user = f.service.provision(&scope, &req).await.unwrap();
        assert_eq!(user.static_ip.as_deref(), Some("100.64.0.9"));
    }

    #[tokio::test]
    async fn test_bulk_isolates_failures() {
        let f = fixture().await;
        for id in 1..=5 {
            let package = if id == 3 { Some(77) } else { Some(10) };
            add_customer(&f.store, id, package).await;
        }
        let results = f
            .service
            .bulk_provision(
                &TenantScope::platform(),
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1, 2, 3, 4, 5],
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.success).count(), 4);
        let third = &results[2];
        assert_eq!(third.customer_id, 3);
        assert_eq!(third.status, bulk_status::FAILED);
        assert_eq!(third.kind.as_deref(), Some("no_profile_mapping"));
        assert_eq!(third.step.as_deref(), Some("profile"));
        assert_eq!(f.router_state.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn test_bulk_item_timeout_reconnects_for_next_item() {
        let mut f = fixture().await;
        f.service.settings.item_timeout = Duration::from_millis(100);
        for id in 1..=3 {
            add_customer(&f.store, id, Some(10)).await;
        }
        f.router_state.lock().unwrap().hang_on = Some("user2".into());

        let results = f
            .service
            .bulk_provision(
                &TenantScope::platform(),
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1, 2, 3],
                },
            )
            .await
            .unwrap();
        assert!(results[0].success);
        assert_eq!(results[1].status, bulk_status::FAILED);
        assert_eq!(results[1].step.as_deref(), Some("router_write"));
        assert_eq!(results[1].kind.as_deref(), Some("device_unreachable"));
        assert!(results[2].success);

        let state = f.router_state.lock().unwrap();
        assert_eq!(state.connects, 2);
        assert_eq!(state.writes, vec![(1, "user1".to_string()), (2, "user3".to_string())]);
        drop(state);
        // The timed out item gave its address back
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 2);
        assert!(f.store.get_network_user_by_customer(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_connect_step() {
        let mut f = fixture().await;
        f.service.settings.item_timeout = Duration::from_millis(100);
        add_customer(&f.store, 1, Some(10)).await;
        f.router_state.lock().unwrap().hang_connect = true;

        let err = f
            .service
            .provision(&TenantScope::platform(), &provision_req(1, f.router.id))
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::Connect);
        assert!(matches!(err.source, NetError::Timeout { .. }));
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 0);
    }

    #[tokio::test]
    async fn test_bulk_reprovision_radius_failure_keeps_existing_record() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        let scope = TenantScope::platform();
        let before = f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        *f.radius.fail.lock().unwrap() = true;

        let results = f
            .service
            .bulk_provision(
                &scope,
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1],
                },
            )
            .await
            .unwrap();
        let item = &results[0];
        assert!(!item.success);
        assert_eq!(item.status, bulk_status::FAILED);
        assert_eq!(item.step.as_deref(), Some("radius_write"));
        assert_eq!(item.kind.as_deref(), Some("partial_failure"));

        let after = f.store.get_network_user_by_customer(1).await.unwrap().unwrap();
        assert_eq!(after.allocation_id, before.allocation_id);
        assert_eq!(after.state, network_user_state::PROVISIONED);
        assert!(after.last_error.as_deref().unwrap_or_default().contains("radius_write"));
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 1);
    }

    #[tokio::test]
    async fn test_bulk_reprovision_persist_failure_is_partial() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        let scope = TenantScope::platform();
        let before = f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER refuse_user_updates BEFORE UPDATE ON network_users BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(f.store.pool())
        .await
        .unwrap();

        let results = f
            .service
            .bulk_provision(
                &scope,
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1],
                },
            )
            .await
            .unwrap();
        let item = &results[0];
        assert_eq!(item.status, bulk_status::FAILED);
        assert_eq!(item.step.as_deref(), Some("persist"));
        assert_eq!(item.kind.as_deref(), Some("partial_failure"));
        assert!(item.error.as_deref().unwrap().contains("local record failed"));
        // Router and RADIUS already hold the new state; the old record and address stay
        assert!(f.radius.users.lock().unwrap().contains_key("user1"));
        let after = f.store.get_network_user_by_customer(1).await.unwrap().unwrap();
        assert_eq!(after.allocation_id, before.allocation_id);
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 1);
    }

    #[tokio::test]
    async fn test_bulk_connect_failure_fails_whole_batch() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        f.router_state.lock().unwrap().fail_connect = true;
        let err = f
            .service
            .bulk_provision(
                &TenantScope::platform(),
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.step, ProvisionStep::Connect);
    }

    #[tokio::test]
    async fn test_bulk_past_deadline_reports_skipped() {
        let mut f = fixture().await;
        f.service.settings.batch_timeout = Duration::ZERO;
        add_customer(&f.store, 1, Some(10)).await;
        let results = f
            .service
            .bulk_provision(
                &TenantScope::platform(),
                &BulkProvisionRequest {
                    router_id: f.router.id,
                    customer_ids: vec![1, 2],
                },
            )
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.status == bulk_status::SKIPPED));
    }

    #[tokio::test]
    async fn test_deprovision_disable_then_delete() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        let scope = TenantScope::platform();
        f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        f.router_state.lock().unwrap().sessions.push(ActiveSession {
            id: "*A1".into(),
            name: "user1".into(),
            ..Default::default()
        });

        let user = f
            .service
            .deprovision(
                &scope,
                &DeprovisionRequest {
                    customer_id: 1,
                    router_id: f.router.id,
                    delete: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(user.state, network_user_state::DEPROVISIONED);
        {
            let state = f.router_state.lock().unwrap();
            assert!(state.sessions.is_empty());
            assert!(state.secrets[0].disabled);
        }
        assert!(f.radius.users.lock().unwrap()["user1"].disabled);
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 1);

        let user = f
            .service
            .deprovision(
                &scope,
                &DeprovisionRequest {
                    customer_id: 1,
                    router_id: f.router.id,
                    delete: true,
                },
            )
            .await
            .unwrap();
        assert!(user.allocation_id.is_none());
        assert!(f.router_state.lock().unwrap().secrets.is_empty());
        assert!(f.radius.users.lock().unwrap().is_empty());
        assert_eq!(live_allocations(&f.ipam, f.pool.id).await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_reports_divergence() {
        let f = fixture().await;
        add_customer(&f.store, 1, Some(10)).await;
        add_customer(&f.store, 2, Some(10)).await;
        let scope = TenantScope::platform();
        f.service.provision(&scope, &provision_req(1, f.router.id)).await.unwrap();
        f.service.provision(&scope, &provision_req(2, f.router.id)).await.unwrap();
        {
            let mut state = f.router_state.lock().unwrap();
            state.secrets.retain(|s| s.name != "user2");
            state.secrets[0].disabled = true;
            state.secrets.push(PppSecret {
                id: "*FF".into(),
                name: "walkin".into(),
                comment: "added by hand".into(),
                ..Default::default()
            });
        }
        let report = f.service.reconcile_router(&scope, f.router.id).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.missing, vec!["user2".to_string()]);
        assert_eq!(report.state_mismatch, vec!["user1".to_string()]);
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].secret_name, "walkin");
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_ensure_profile_creates_once() {
        let f = fixture().await;
        let scope = TenantScope::platform();
        let attrs = PppProfileAttributes {
            name: "20M".into(),
            rate_limit: Some("20M/20M".into()),
            ..Default::default()
        };
        let first = f.service.ensure_profile(&scope, f.router.id, &attrs).await.unwrap();
        let second = f.service.ensure_profile(&scope, f.router.id, &attrs).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.router_state.lock().unwrap().profiles.len(), 1);
    }

    #[tokio::test]
    async fn test_router_hidden_from_other_tenant() {
        let f = fixture().await;
        let err = f.service.list_profiles(&TenantScope::tenant(42), f.router.id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
