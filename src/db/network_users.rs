use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::models::*;

use super::row_helpers::map_network_user_row;

const SELECT_NETWORK_USER: &str = r#"
    SELECT id, tenant_id, customer_id, router_id, username, password, profile, service_type,
           static_ip, allocation_id, package_id, expiry_date, router_comment, state, last_error,
           provisioned_at, created_at, updated_at
    FROM network_users
"#;

/// Network user (PPPoE identity) operations
pub struct NetworkUserRepo;

impl NetworkUserRepo {
    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<NetworkUser>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_NETWORK_USER))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_network_user_row))
    }

    pub async fn get_by_customer(pool: &Pool<Sqlite>, customer_id: i64) -> Result<Option<NetworkUser>> {
        let row = sqlx::query(&format!("{} WHERE customer_id = ?", SELECT_NETWORK_USER))
            .bind(customer_id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_network_user_row))
    }

    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<NetworkUser>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR tenant_id = ?) ORDER BY username",
            SELECT_NETWORK_USER
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_network_user_row).collect())
    }

    pub async fn list_by_router(pool: &Pool<Sqlite>, router_id: i64) -> Result<Vec<NetworkUser>> {
        let rows = sqlx::query(&format!(
            "{} WHERE router_id = ? ORDER BY username",
            SELECT_NETWORK_USER
        ))
        .bind(router_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_network_user_row).collect())
    }

    /// Record a fully provisioned user. Only called once router and RADIUS writes succeeded.
    pub async fn upsert_provisioned(
        pool: &Pool<Sqlite>,
        tenant_id: Option<i64>,
        user: &ProvisionedUser,
    ) -> Result<NetworkUser> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO network_users (tenant_id, customer_id, router_id, username, password, profile,
                                       service_type, static_ip, allocation_id, package_id, expiry_date,
                                       router_comment, state, last_error, provisioned_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'provisioned', '', ?, ?, ?)
            ON CONFLICT(customer_id) DO UPDATE SET
                router_id = excluded.router_id,
                username = excluded.username,
                password = excluded.password,
                profile = excluded.profile,
                service_type = excluded.service_type,
                static_ip = excluded.static_ip,
                allocation_id = excluded.allocation_id,
                package_id = excluded.package_id,
                expiry_date = excluded.expiry_date,
                router_comment = excluded.router_comment,
                state = 'provisioned',
                last_error = '',
                provisioned_at = excluded.provisioned_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(user.customer_id)
        .bind(user.router_id)
        .bind(&user.username)
        .bind(&user.password)
        .bind(&user.profile)
        .bind(&user.service_type)
        .bind(user.static_ip.clone().unwrap_or_default())
        .bind(user.allocation_id)
        .bind(user.package_id)
        .bind(user.expiry_date)
        .bind(&user.router_comment)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_customer(pool, user.customer_id)
            .await?
            .context("Network user not found after upsert")
    }

    pub async fn mark_deprovisioned(pool: &Pool<Sqlite>, id: i64, clear_allocation: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE network_users SET state = 'deprovisioned',
                   allocation_id = CASE WHEN ? THEN NULL ELSE allocation_id END,
                   last_error = '', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(clear_allocation)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Network user", &id.to_string()).into());
        }
        Ok(())
    }

    /// Remember the last failure without touching the provisioning state
    pub async fn set_error(pool: &Pool<Sqlite>, customer_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE network_users SET last_error = ?, updated_at = ? WHERE customer_id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(customer_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
