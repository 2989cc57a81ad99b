use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

use crate::models::*;
use crate::utils;
use crate::db::row_helpers::{map_allocation_row, map_history_row};

const SELECT_ALLOCATION: &str = r#"
    SELECT id, pool_id, tenant_id, address, address_int, mac_address, username, status,
           allocated_at, released_at, updated_at
    FROM ip_allocations
"#;

/// Outcome of releasing an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
    Missing,
}

pub struct IpAllocationRepo;

impl IpAllocationRepo {
    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<IpAllocation>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ALLOCATION))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_allocation_row))
    }

    pub async fn list_by_pool(pool: &Pool<Sqlite>, pool_id: i64) -> Result<Vec<IpAllocation>> {
        let rows = sqlx::query(&format!(
            "{} WHERE pool_id = ? ORDER BY address_int, id",
            SELECT_ALLOCATION
        ))
        .bind(pool_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_allocation_row).collect())
    }

    /// Integer addresses held by non-released allocations, ascending
    pub async fn live_addresses(pool: &Pool<Sqlite>, pool_id: i64) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            "SELECT address_int FROM ip_allocations WHERE pool_id = ? AND status <> 'released' ORDER BY address_int",
        )
        .bind(pool_id)
        .fetch_all(pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("address_int") as u32)
            .collect())
    }

    pub async fn find_active_by_mac(
        pool: &Pool<Sqlite>,
        pool_id: i64,
        mac: &str,
    ) -> Result<Option<IpAllocation>> {
        let row = sqlx::query(&format!(
            "{} WHERE pool_id = ? AND mac_address = ? AND status = 'active' LIMIT 1",
            SELECT_ALLOCATION
        ))
        .bind(pool_id)
        .bind(mac)
        .fetch_optional(pool)
        .await?;
        Ok(row.as_ref().map(map_allocation_row))
    }

    pub async fn find_live_by_address(
        pool: &Pool<Sqlite>,
        pool_id: i64,
        address_int: u32,
    ) -> Result<Option<IpAllocation>> {
        let row = sqlx::query(&format!(
            "{} WHERE pool_id = ? AND address_int = ? AND status <> 'released' LIMIT 1",
            SELECT_ALLOCATION
        ))
        .bind(pool_id)
        .bind(address_int as i64)
        .fetch_optional(pool)
        .await?;
        Ok(row.as_ref().map(map_allocation_row))
    }

    pub async fn find_active_by_username(
        pool: &Pool<Sqlite>,
        username: &str,
    ) -> Result<Vec<IpAllocation>> {
        let rows = sqlx::query(&format!(
            "{} WHERE username = ? AND status = 'active' ORDER BY id",
            SELECT_ALLOCATION
        ))
        .bind(username)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_allocation_row).collect())
    }

    /// Insert a live allocation. Returns `None` when the address is already
    /// held, as reported by the partial unique index.
    pub async fn insert(
        pool: &Pool<Sqlite>,
        ip_pool: &IpPool,
        address_int: u32,
        mac: &str,
        username: &str,
        status: &str,
    ) -> Result<Option<IpAllocation>> {
        let now = Utc::now();
        let address = utils::u32_to_ipv4(address_int);
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ip_allocations (pool_id, tenant_id, address, address_int, mac_address, username,
                                        status, allocated_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ip_pool.id)
        .bind(ip_pool.tenant_id)
        .bind(&address)
        .bind(address_int as i64)
        .bind(mac)
        .bind(username)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(r) => r.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        record_history(&mut tx, id, ip_pool.id, &address, mac, username, allocation_action::ALLOCATED).await?;

        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ALLOCATION))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(map_allocation_row(&row)))
    }

    /// Mark an allocation released. Releasing twice is a no-op.
    pub async fn release(pool: &Pool<Sqlite>, id: i64) -> Result<ReleaseOutcome> {
        let now = Utc::now();
        let mut tx = pool.begin().await?;

        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ALLOCATION))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(allocation) = row.as_ref().map(map_allocation_row) else {
            return Ok(ReleaseOutcome::Missing);
        };

        let result = sqlx::query(
            "UPDATE ip_allocations SET status = 'released', released_at = ?, updated_at = ? WHERE id = ? AND status <> 'released'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(ReleaseOutcome::AlreadyReleased);
        }

        record_history(
            &mut tx,
            id,
            allocation.pool_id,
            &allocation.address,
            &allocation.mac_address,
            &allocation.username,
            allocation_action::RELEASED,
        )
        .await?;
        tx.commit().await?;
        Ok(ReleaseOutcome::Released)
    }

    pub async fn history(pool: &Pool<Sqlite>, pool_id: i64) -> Result<Vec<AllocationHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM ip_allocation_history WHERE pool_id = ? ORDER BY id",
        )
        .bind(pool_id)
        .fetch_all(pool)
        .await
        .context("Failed to load allocation history")?;
        Ok(rows.iter().map(map_history_row).collect())
    }
}

async fn record_history(
    conn: &mut SqliteConnection,
    allocation_id: i64,
    pool_id: i64,
    address: &str,
    mac: &str,
    username: &str,
    action: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ip_allocation_history (allocation_id, pool_id, address, mac_address, username, action, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(allocation_id)
    .bind(pool_id)
    .bind(address)
    .bind(mac)
    .bind(username)
    .bind(action)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}
