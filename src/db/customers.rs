use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::models::*;

use super::row_helpers::{map_customer_row, map_mapping_row};

const SELECT_CUSTOMER: &str = r#"
    SELECT id, tenant_id, username, password, mac_address, package_id, expiry_date,
           created_at, updated_at
    FROM customers
"#;

const SELECT_MAPPING: &str = r#"
    SELECT id, tenant_id, package_id, router_id, profile_name, ip_pool_id, speed_control_method,
           rate_limit, created_at, updated_at
    FROM package_profile_mappings
"#;

/// Local mirror of billing customers
pub struct CustomerRepo;

impl CustomerRepo {
    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<Customer>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR tenant_id = ?) ORDER BY id",
            SELECT_CUSTOMER
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_customer_row).collect())
    }

    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Customer>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_CUSTOMER))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_customer_row))
    }

    /// Insert or refresh the mirror row keyed by the billing id
    pub async fn upsert(pool: &Pool<Sqlite>, tenant_id: Option<i64>, req: &UpsertCustomerRequest) -> Result<Customer> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO customers (id, tenant_id, username, password, mac_address, package_id, expiry_date,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                username = excluded.username,
                password = excluded.password,
                mac_address = excluded.mac_address,
                package_id = excluded.package_id,
                expiry_date = excluded.expiry_date,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(req.id)
        .bind(tenant_id)
        .bind(&req.username)
        .bind(&req.password)
        .bind(req.mac_address.clone().unwrap_or_default())
        .bind(req.package_id)
        .bind(req.expiry_date)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, req.id)
            .await?
            .context("Customer not found after upsert")
    }
}

/// Package -> router profile mapping operations
pub struct PackageMappingRepo;

impl PackageMappingRepo {
    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<PackageProfileMapping>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR tenant_id = ?) ORDER BY package_id, router_id",
            SELECT_MAPPING
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_mapping_row).collect())
    }

    pub async fn find(pool: &Pool<Sqlite>, package_id: i64, router_id: i64) -> Result<Option<PackageProfileMapping>> {
        let row = sqlx::query(&format!(
            "{} WHERE package_id = ? AND router_id = ?",
            SELECT_MAPPING
        ))
        .bind(package_id)
        .bind(router_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.as_ref().map(map_mapping_row))
    }

    pub async fn create(
        pool: &Pool<Sqlite>,
        tenant_id: Option<i64>,
        req: &CreatePackageMappingRequest,
    ) -> Result<PackageProfileMapping> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO package_profile_mappings (tenant_id, package_id, router_id, profile_name, ip_pool_id,
                                                  speed_control_method, rate_limit, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(package_id, router_id) DO UPDATE SET
                profile_name = excluded.profile_name,
                ip_pool_id = excluded.ip_pool_id,
                speed_control_method = excluded.speed_control_method,
                rate_limit = excluded.rate_limit,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(req.package_id)
        .bind(req.router_id)
        .bind(&req.profile_name)
        .bind(req.ip_pool_id)
        .bind(req.speed_control_method.clone().unwrap_or_default())
        .bind(req.rate_limit.clone().unwrap_or_default())
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::find(pool, req.package_id, req.router_id)
            .await?
            .context("Package mapping not found after creation")
    }

    pub async fn delete(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM package_profile_mappings WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Package mapping", &id.to_string()).into());
        }
        Ok(())
    }
}
