use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

use crate::models::*;
use crate::utils::{self, CidrInfo};
use crate::db::row_helpers::map_pool_row;

const SELECT_POOL: &str = r#"
    SELECT p.*,
           COALESCE((SELECT COUNT(*) FROM ip_allocations a
                     WHERE a.pool_id = p.id AND a.status <> 'released'), 0) as active_allocations
    FROM ip_pools p
"#;

/// Validated geometry of a new pool
#[derive(Debug, Clone, Copy)]
pub struct PoolGeometry {
    pub cidr: CidrInfo,
    pub range_start: u32,
    pub range_end: u32,
}

pub struct IpPoolRepo;

impl IpPoolRepo {
    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<IpPool>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR p.tenant_id = ?) ORDER BY p.network_int",
            SELECT_POOL
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_pool_row).collect())
    }

    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<IpPool>> {
        let row = sqlx::query(&format!("{} WHERE p.id = ?", SELECT_POOL))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_pool_row))
    }

    /// Pools of the same tenant whose CIDR intersects `[network, broadcast]`
    pub async fn find_overlapping(
        pool: &Pool<Sqlite>,
        tenant_id: Option<i64>,
        cidr: &CidrInfo,
    ) -> Result<Vec<IpPool>> {
        let rows = sqlx::query(&format!(
            "{} WHERE p.tenant_id IS ? AND p.network_int <= ? AND p.broadcast_int >= ?",
            SELECT_POOL
        ))
        .bind(tenant_id)
        .bind(cidr.broadcast as i64)
        .bind(cidr.network as i64)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_pool_row).collect())
    }

    pub async fn create(
        pool: &Pool<Sqlite>,
        tenant_id: Option<i64>,
        req: &CreateIpPoolRequest,
        geometry: &PoolGeometry,
    ) -> Result<IpPool> {
        let now = Utc::now();
        let cidr = format!(
            "{}/{}",
            utils::u32_to_ipv4(geometry.cidr.network),
            geometry.cidr.prefix_length
        );
        let result = sqlx::query(
            r#"
            INSERT INTO ip_pools (tenant_id, name, cidr, network_int, broadcast_int, prefix_length,
                                  range_start_int, range_end_int, gateway, dns_primary, dns_secondary,
                                  description, allow_shared_mac, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(&req.name)
        .bind(&cidr)
        .bind(geometry.cidr.network as i64)
        .bind(geometry.cidr.broadcast as i64)
        .bind(geometry.cidr.prefix_length as i64)
        .bind(geometry.range_start as i64)
        .bind(geometry.range_end as i64)
        .bind(req.gateway.clone().unwrap_or_default())
        .bind(req.dns_primary.clone().unwrap_or_default())
        .bind(req.dns_secondary.clone().unwrap_or_default())
        .bind(req.description.clone().unwrap_or_default())
        .bind(req.allow_shared_mac)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, result.last_insert_rowid())
            .await?
            .context("IP pool not found after creation")
    }

    pub async fn update(pool: &Pool<Sqlite>, id: i64, req: &UpdateIpPoolRequest) -> Result<IpPool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE ip_pools SET name = ?, gateway = ?, dns_primary = ?, dns_secondary = ?,
                                description = ?, status = COALESCE(?, status), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&req.name)
        .bind(req.gateway.clone().unwrap_or_default())
        .bind(req.dns_primary.clone().unwrap_or_default())
        .bind(req.dns_secondary.clone().unwrap_or_default())
        .bind(req.description.clone().unwrap_or_default())
        .bind(req.status.clone())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::db::NotFoundError::new("IP pool", &id.to_string()).into());
        }
        Self::get(pool, id)
            .await?
            .context("IP pool not found after update")
    }

    pub async fn delete(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
        // Released rows are history; they go with the pool
        sqlx::query("DELETE FROM ip_allocation_history WHERE pool_id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM ip_allocations WHERE pool_id = ? AND status = 'released'")
            .bind(id)
            .execute(pool)
            .await?;
        let result = sqlx::query("DELETE FROM ip_pools WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(crate::db::NotFoundError::new("IP pool", &id.to_string()).into());
        }
        Ok(())
    }

    pub async fn count_live_allocations(pool: &Pool<Sqlite>, id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt FROM ip_allocations WHERE pool_id = ? AND status <> 'released'",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(row.get("cnt"))
    }
}
