use std::collections::BTreeSet;
use std::sync::Arc;

use crate::db::{PoolGeometry, ReleaseOutcome, Store};
use crate::error::{NetError, NetResult};
use crate::models::*;
use crate::utils::{self, KeyedLocks};

/// Attempts to claim a free address before giving up on contention
const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Lazy, restartable enumeration of free addresses in a pool.
///
/// Built from a point-in-time view of live allocations, so results are
/// advisory: an address may be taken the moment after it is yielded.
#[derive(Debug, Clone)]
pub struct AvailableIps {
    start: u64,
    end: u64,
    cursor: u64,
    taken: Arc<BTreeSet<u32>>,
}

impl AvailableIps {
    fn new(start: u32, end: u32, taken: BTreeSet<u32>) -> Self {
        Self {
            start: start as u64,
            end: end as u64,
            cursor: start as u64,
            taken: Arc::new(taken),
        }
    }

    /// Rewind to the first address of the range
    pub fn restart(&mut self) {
        self.cursor = self.start;
    }

    /// Next free address in integer form
    pub fn next_u32(&mut self) -> Option<u32> {
        while self.cursor <= self.end {
            let candidate = self.cursor as u32;
            self.cursor += 1;
            if !self.taken.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl Iterator for AvailableIps {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_u32().map(utils::u32_to_ipv4)
    }
}

/// Addresses a pool never hands out besides its network and broadcast
fn infrastructure_addresses(pool: &IpPool) -> BTreeSet<u32> {
    pool.gateway
        .as_deref()
        .and_then(|g| utils::ipv4_to_u32(g).ok())
        .into_iter()
        .collect()
}

fn allocatable_count(pool: &IpPool) -> u64 {
    let start = pool.range_start_int as u64;
    let end = pool.range_end_int as u64;
    if end < start {
        return 0;
    }
    let reserved = infrastructure_addresses(pool)
        .iter()
        .filter(|a| (**a as u64) >= start && (**a as u64) <= end)
        .count() as u64;
    (end - start + 1).saturating_sub(reserved)
}

/// Per-pool address allocation with a lock per pool and a unique index as backstop
#[derive(Clone)]
pub struct IpamService {
    store: Store,
    locks: KeyedLocks,
}

impl IpamService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Load a pool visible in `scope`
    pub async fn get_pool(&self, scope: &TenantScope, pool_id: i64) -> NetResult<IpPool> {
        match self.store.get_pool(pool_id).await? {
            Some(pool) if scope.allows(pool.tenant_id) => Ok(pool),
            _ => Err(NetError::not_found("IP pool", pool_id)),
        }
    }

    pub async fn list_pools(&self, scope: &TenantScope) -> NetResult<Vec<IpPool>> {
        Ok(self.store.list_pools(scope).await?)
    }

    pub async fn create_pool(&self, scope: &TenantScope, req: &CreateIpPoolRequest) -> NetResult<IpPool> {
        if req.name.trim().is_empty() {
            return Err(NetError::invalid("pool name is required"));
        }
        let cidr = utils::parse_cidr(&req.cidr).map_err(|e| NetError::invalid(e.to_string()))?;
        let (first_host, last_host) = cidr.host_range();

        let parse_bound = |value: &Option<String>, default: u32, label: &str| -> NetResult<u32> {
            match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                None => Ok(default),
                Some(v) => {
                    let addr = utils::ipv4_to_u32(v).map_err(|e| NetError::invalid(e.to_string()))?;
                    if addr < first_host || addr > last_host {
                        return Err(NetError::invalid(format!("{} {} is outside the usable hosts of {}", label, v, req.cidr)));
                    }
                    Ok(addr)
                }
            }
        };
        let range_start = parse_bound(&req.range_start, first_host, "range start")?;
        let range_end = parse_bound(&req.range_end, last_host, "range end")?;
        if range_start > range_end {
            return Err(NetError::invalid("range start is after range end"));
        }

        if let Some(gw) = req.gateway.as_deref().filter(|g| !g.is_empty()) {
            let addr = utils::ipv4_to_u32(gw).map_err(|e| NetError::invalid(e.to_string()))?;
            if !cidr.contains(addr) {
                return Err(NetError::invalid(format!("gateway {} is outside {}", gw, req.cidr)));
            }
        }
        for dns in [&req.dns_primary, &req.dns_secondary].into_iter().flatten() {
            if !dns.is_empty() && !utils::is_valid_ipv4(dns) {
                return Err(NetError::invalid(format!("invalid DNS server {}", dns)));
            }
        }

        let overlapping = self.store.find_overlapping_pools(scope.tenant_id, &cidr).await?;
        if let Some(existing) = overlapping.first() {
            return Err(NetError::invalid(format!(
                "{} overlaps existing pool {} ({})",
                req.cidr, existing.name, existing.cidr
            )));
        }

        let geometry = PoolGeometry {
            cidr,
            range_start,
            range_end,
        };
        let pool = self.store.create_pool(scope.tenant_id, req, &geometry).await?;
        tracing::info!("Created IP pool {} ({}) with {} allocatable addresses", pool.name, pool.cidr, allocatable_count(&pool));
        Ok(pool)
    }

    pub async fn update_pool(&self, scope: &TenantScope, pool_id: i64, req: &UpdateIpPoolRequest) -> NetResult<IpPool> {
        let pool = self.get_pool(scope, pool_id).await?;
        if let Some(status) = req.status.as_deref() {
            if status != pool_status::ACTIVE && status != pool_status::INACTIVE {
                return Err(NetError::invalid(format!("unknown pool status {}", status)));
            }
        }
        if let Some(gw) = req.gateway.as_deref().filter(|g| !g.is_empty()) {
            let addr = utils::ipv4_to_u32(gw).map_err(|e| NetError::invalid(e.to_string()))?;
            if addr < pool.network_int as u32 || addr > pool.broadcast_int as u32 {
                return Err(NetError::invalid(format!("gateway {} is outside {}", gw, pool.cidr)));
            }
        }
        Ok(self.store.update_pool(pool.id, req).await?)
    }

    /// Delete a pool that holds no live allocations
    pub async fn delete_pool(&self, scope: &TenantScope, pool_id: i64) -> NetResult<()> {
        let pool = self.get_pool(scope, pool_id).await?;
        let _guard = self.locks.lock(&pool_key(pool.id)).await;
        let live = self.store.count_live_allocations(pool.id).await?;
        if live > 0 {
            return Err(NetError::invalid(format!("pool {} still has {} live allocations", pool.name, live)));
        }
        self.store.delete_pool(pool.id).await?;
        Ok(())
    }

    /// Hand out the lowest free address of the pool to `mac`
    pub async fn allocate_ip(
        &self,
        scope: &TenantScope,
        pool_id: i64,
        mac_address: &str,
        username: &str,
    ) -> NetResult<IpAllocation> {
        if !utils::is_valid_mac(mac_address) {
            return Err(NetError::invalid(format!("invalid MAC address {:?}", mac_address)));
        }
        let mac = utils::normalize_mac(mac_address);
        let pool = self.get_pool(scope, pool_id).await?;
        if !pool.is_active() {
            return Err(NetError::invalid(format!("pool {} is not active", pool.name)));
        }

        let _guard = self.locks.lock(&pool_key(pool.id)).await;

        if let Some(existing) = self.store.find_active_allocation_by_mac(pool.id, &mac).await? {
            if existing.username == username {
                tracing::debug!("MAC {} already holds {} in pool {}", mac, existing.address, pool.name);
                return Ok(existing);
            }
            if !pool.allow_shared_mac {
                return Err(NetError::invalid(format!(
                    "MAC {} already holds {} for another user in pool {}",
                    mac, existing.address, pool.name
                )));
            }
        }

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let mut free = self.free_addresses(&pool).await?;
            let Some(candidate) = free.next_u32() else {
                tracing::warn!("IP pool {} exhausted", pool.name);
                return Err(NetError::PoolExhausted { pool_id: pool.id });
            };
            match self
                .store
                .insert_allocation(&pool, candidate, &mac, username, allocation_status::ACTIVE)
                .await?
            {
                Some(allocation) => {
                    tracing::info!("Allocated {} from pool {} to {} ({})", allocation.address, pool.name, mac, username);
                    return Ok(allocation);
                }
                None => {
                    tracing::debug!(
                        "Address {} in pool {} claimed concurrently (attempt {})",
                        utils::u32_to_ipv4(candidate),
                        pool.name,
                        attempt
                    );
                }
            }
        }
        Err(NetError::Storage(format!(
            "could not claim an address in pool {} after {} attempts",
            pool.name, MAX_CLAIM_ATTEMPTS
        )))
    }

    /// Claim one specific address (static assignment or admin hold)
    pub async fn claim_address(
        &self,
        scope: &TenantScope,
        pool_id: i64,
        address: &str,
        mac_address: &str,
        username: &str,
        status: &str,
    ) -> NetResult<IpAllocation> {
        if !utils::is_valid_mac(mac_address) {
            return Err(NetError::invalid(format!("invalid MAC address {:?}", mac_address)));
        }
        let mac = utils::normalize_mac(mac_address);
        let addr = utils::ipv4_to_u32(address).map_err(|e| NetError::invalid(e.to_string()))?;
        let pool = self.get_pool(scope, pool_id).await?;
        if !pool.is_active() {
            return Err(NetError::invalid(format!("pool {} is not active", pool.name)));
        }
        if (addr as i64) < pool.range_start_int || (addr as i64) > pool.range_end_int {
            return Err(NetError::invalid(format!("{} is outside the range of pool {}", address, pool.name)));
        }
        if infrastructure_addresses(&pool).contains(&addr) {
            return Err(NetError::invalid(format!("{} is reserved infrastructure in pool {}", address, pool.name)));
        }

        let _guard = self.locks.lock(&pool_key(pool.id)).await;
        if let Some(existing) = self.store.find_live_allocation_by_address(pool.id, addr).await? {
            if existing.mac_address == mac && existing.username == username {
                return Ok(existing);
            }
            return Err(NetError::invalid(format!("{} is already allocated", address)));
        }
        if status == allocation_status::ACTIVE && !pool.allow_shared_mac {
            if let Some(other) = self.store.find_active_allocation_by_mac(pool.id, &mac).await? {
                if other.username != username {
                    return Err(NetError::invalid(format!(
                        "MAC {} already holds {} for another user in pool {}",
                        mac, other.address, pool.name
                    )));
                }
            }
        }
        self.store
            .insert_allocation(&pool, addr, &mac, username, status)
            .await?
            .ok_or_else(|| NetError::invalid(format!("{} is already allocated", address)))
    }

    pub async fn reserve_ip(&self, scope: &TenantScope, req: &ReserveIpRequest) -> NetResult<IpAllocation> {
        self.claim_address(
            scope,
            req.pool_id,
            &req.address,
            &req.mac_address,
            &req.username,
            allocation_status::RESERVED,
        )
        .await
    }

    /// Release an allocation. Releasing twice is a no-op that still returns true.
    pub async fn release_ip(&self, scope: &TenantScope, allocation_id: i64) -> NetResult<bool> {
        let allocation = match self.store.get_allocation(allocation_id).await? {
            Some(a) if scope.allows(a.tenant_id) => a,
            _ => return Err(NetError::not_found("IP allocation", allocation_id)),
        };
        match self.store.release_allocation(allocation.id).await? {
            ReleaseOutcome::Released => {
                tracing::info!("Released {} from pool {}", allocation.address, allocation.pool_id);
                Ok(true)
            }
            ReleaseOutcome::AlreadyReleased => Ok(true),
            ReleaseOutcome::Missing => Err(NetError::not_found("IP allocation", allocation_id)),
        }
    }

    pub async fn get_available_ips(&self, scope: &TenantScope, pool_id: i64) -> NetResult<AvailableIps> {
        let pool = self.get_pool(scope, pool_id).await?;
        self.free_addresses(&pool).await
    }

    pub async fn get_pool_utilization(&self, scope: &TenantScope, pool_id: i64) -> NetResult<PoolUtilization> {
        let pool = self.get_pool(scope, pool_id).await?;
        let total = allocatable_count(&pool);
        let allocated = (self.store.count_live_allocations(pool.id).await?.max(0) as u64).min(total);
        let utilization_percent = if total == 0 {
            0.0
        } else {
            ((allocated as f64 / total as f64) * 10_000.0).round() / 100.0
        };
        Ok(PoolUtilization {
            pool_id: pool.id,
            total,
            allocated,
            available: total - allocated,
            utilization_percent,
        })
    }

    pub async fn list_allocations(&self, scope: &TenantScope, pool_id: i64) -> NetResult<Vec<IpAllocation>> {
        let pool = self.get_pool(scope, pool_id).await?;
        Ok(self.store.list_allocations(pool.id).await?)
    }

    pub async fn allocation_history(&self, scope: &TenantScope, pool_id: i64) -> NetResult<Vec<AllocationHistoryEntry>> {
        let pool = self.get_pool(scope, pool_id).await?;
        Ok(self.store.allocation_history(pool.id).await?)
    }

    /// Active allocations held by one subscriber across every visible pool
    pub async fn find_active_by_username(&self, scope: &TenantScope, username: &str) -> NetResult<Vec<IpAllocation>> {
        let allocations = self.store.find_active_allocations_by_username(username).await?;
        Ok(allocations.into_iter().filter(|a| scope.allows(a.tenant_id)).collect())
    }

    async fn free_addresses(&self, pool: &IpPool) -> NetResult<AvailableIps> {
        let mut taken: BTreeSet<u32> = self.store.live_addresses(pool.id).await?.into_iter().collect();
        taken.extend(infrastructure_addresses(pool));
        Ok(AvailableIps::new(pool.range_start_int as u32, pool.range_end_int as u32, taken))
    }
}

fn pool_key(pool_id: i64) -> String {
    format!("pool:{}", pool_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_store;

    fn pool_req(cidr: &str) -> CreateIpPoolRequest {
        CreateIpPoolRequest {
            name: format!("pool {}", cidr),
            cidr: cidr.to_string(),
            gateway: None,
            dns_primary: None,
            dns_secondary: None,
            range_start: None,
            range_end: None,
            description: None,
            allow_shared_mac: false,
        }
    }

    fn mac(n: usize) -> String {
        format!("00:11:22:33:44:{:02x}", n)
    }

    async fn service() -> IpamService {
        IpamService::new(memory_store().await)
    }

    #[tokio::test]
    async fn test_find_active_by_username_skips_released() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.9.0.0/29")).await.unwrap();

        let first = ipam.allocate_ip(&scope, pool.id, &mac(1), "carol").await.unwrap();
        ipam.allocate_ip(&scope, pool.id, &mac(2), "dave").await.unwrap();
        assert_eq!(ipam.find_active_by_username(&scope, "carol").await.unwrap().len(), 1);

        ipam.release_ip(&scope, first.id).await.unwrap();
        assert!(ipam.find_active_by_username(&scope, "carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocates_lowest_free_address_skipping_gateway() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let mut req = pool_req("10.0.0.0/29");
        req.gateway = Some("10.0.0.1".into());
        let pool = ipam.create_pool(&scope, &req).await.unwrap();

        let a = ipam.allocate_ip(&scope, pool.id, &mac(1), "alice").await.unwrap();
        let b = ipam.allocate_ip(&scope, pool.id, &mac(2), "bob").await.unwrap();
        assert_eq!(a.address, "10.0.0.2");
        assert_eq!(b.address, "10.0.0.3");
        assert_eq!(a.status, "active");
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct_then_exhausted() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        // /29 has 6 usable hosts
        let pool = ipam.create_pool(&scope, &pool_req("192.168.50.0/29")).await.unwrap();
        let pool_id = pool.id;

        let calls = (0..6).map(|i| {
            let ipam = ipam.clone();
            async move { ipam.allocate_ip(&scope, pool_id, &mac(i), &format!("user{}", i)).await }
        });
        let results = futures::future::join_all(calls).await;
        let mut addresses: Vec<String> = results.into_iter().map(|r| r.unwrap().address).collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 6);

        let err = ipam.allocate_ip(&scope, pool.id, &mac(99), "late").await.unwrap_err();
        assert!(matches!(err, NetError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.1.0.0/28")).await.unwrap();
        let a = ipam.allocate_ip(&scope, pool.id, &mac(1), "alice").await.unwrap();

        assert!(ipam.release_ip(&scope, a.id).await.unwrap());
        assert!(ipam.release_ip(&scope, a.id).await.unwrap());

        let all = ipam.list_allocations(&scope, pool.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "released");

        // The released address is handed out again
        let again = ipam.allocate_ip(&scope, pool.id, &mac(2), "bob").await.unwrap();
        assert_eq!(again.address, a.address);

        let err = ipam.release_ip(&scope, 9999).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_utilization_for_ten_address_pool() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let mut req = pool_req("10.2.0.0/24");
        req.range_start = Some("10.2.0.10".into());
        req.range_end = Some("10.2.0.19".into());
        let pool = ipam.create_pool(&scope, &req).await.unwrap();
        for i in 0..3 {
            ipam.allocate_ip(&scope, pool.id, &mac(i), &format!("u{}", i)).await.unwrap();
        }
        let util = ipam.get_pool_utilization(&scope, pool.id).await.unwrap();
        assert_eq!(
            util,
            PoolUtilization {
                pool_id: pool.id,
                total: 10,
                allocated: 3,
                available: 7,
                utilization_percent: 30.0,
            }
        );
    }

    #[tokio::test]
    async fn test_available_ips_is_lazy_and_restartable() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.3.0.0/29")).await.unwrap();
        ipam.allocate_ip(&scope, pool.id, &mac(1), "alice").await.unwrap();

        let mut free = ipam.get_available_ips(&scope, pool.id).await.unwrap();
        let first_two: Vec<String> = free.by_ref().take(2).collect();
        assert_eq!(first_two, vec!["10.3.0.2", "10.3.0.3"]);
        free.restart();
        assert_eq!(free.count(), 5);
    }

    #[tokio::test]
    async fn test_invalid_mac_and_unknown_pool() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.4.0.0/29")).await.unwrap();

        let err = ipam.allocate_ip(&scope, pool.id, "not-a-mac", "x").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let err = ipam.allocate_ip(&scope, 4242, &mac(1), "x").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_same_mac_same_user_is_idempotent_other_user_rejected() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.5.0.0/29")).await.unwrap();

        let a = ipam.allocate_ip(&scope, pool.id, "00-11-22-33-44-55", "alice").await.unwrap();
        let again = ipam.allocate_ip(&scope, pool.id, "00:11:22:33:44:55", "alice").await.unwrap();
        assert_eq!(a.id, again.id);

        let err = ipam.allocate_ip(&scope, pool.id, "00:11:22:33:44:55", "mallory").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_claim_address_rejects_mac_held_by_other_user() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.8.0.0/29")).await.unwrap();
        ipam.allocate_ip(&scope, pool.id, &mac(1), "alice").await.unwrap();

        let err = ipam
            .claim_address(&scope, pool.id, "10.8.0.5", &mac(1), "mallory", allocation_status::ACTIVE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(ipam.find_active_by_username(&scope, "mallory").await.unwrap().is_empty());

        // The holder itself may still move to a fixed address
        let fixed = ipam
            .claim_address(&scope, pool.id, "10.8.0.5", &mac(1), "alice", allocation_status::ACTIVE)
            .await
            .unwrap();
        assert_eq!(fixed.address, "10.8.0.5");

        let shared = ipam
            .create_pool(&scope, &CreateIpPoolRequest { allow_shared_mac: true, ..pool_req("10.8.1.0/29") })
            .await
            .unwrap();
        ipam.allocate_ip(&scope, shared.id, &mac(1), "alice").await.unwrap();
        ipam.claim_address(&scope, shared.id, "10.8.1.5", &mac(1), "mallory", allocation_status::ACTIVE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_overlap_and_tenant_visibility() {
        let ipam = service().await;
        let t1 = TenantScope::tenant(1);
        let t2 = TenantScope::tenant(2);
        let pool = ipam.create_pool(&t1, &pool_req("172.16.0.0/24")).await.unwrap();

        let err = ipam.create_pool(&t1, &pool_req("172.16.0.128/25")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        // Another tenant may reuse the same private range
        ipam.create_pool(&t2, &pool_req("172.16.0.0/24")).await.unwrap();

        let err = ipam.get_pool(&t2, pool.id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(ipam.get_pool(&TenantScope::platform(), pool.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_pool_requires_no_live_allocations() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.6.0.0/29")).await.unwrap();
        let a = ipam.allocate_ip(&scope, pool.id, &mac(1), "alice").await.unwrap();

        assert!(ipam.delete_pool(&scope, pool.id).await.is_err());
        ipam.release_ip(&scope, a.id).await.unwrap();
        ipam.delete_pool(&scope, pool.id).await.unwrap();
        assert!(ipam.get_pool(&scope, pool.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reserve_specific_address() {
        let ipam = service().await;
        let scope = TenantScope::platform();
        let pool = ipam.create_pool(&scope, &pool_req("10.7.0.0/29")).await.unwrap();
        let req = ReserveIpRequest {
            pool_id: pool.id,
            address: "10.7.0.2".into(),
            mac_address: mac(1),
            username: "static".into(),
        };
        let held = ipam.reserve_ip(&scope, &req).await.unwrap();
        assert_eq!(held.status, "reserved");

        // Dynamic allocation skips the held address
        let next = ipam.allocate_ip(&scope, pool.id, &mac(2), "bob").await.unwrap();
        assert_eq!(next.address, "10.7.0.1");
        let next = ipam.allocate_ip(&scope, pool.id, &mac(3), "carol").await.unwrap();
        assert_eq!(next.address, "10.7.0.3");

        let outside = ReserveIpRequest { address: "10.8.0.1".into(), ..req };
        assert!(ipam.reserve_ip(&scope, &outside).await.is_err());
    }
}
