use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::models::*;

use super::row_helpers::map_router_row;

const SELECT_ROUTER: &str = r#"
    SELECT id, tenant_id, name, host, api_port, username, password, vendor, status,
           created_at, updated_at
    FROM routers
"#;

/// Router descriptor operations
pub struct RouterRepo;

impl RouterRepo {
    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<Router>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR tenant_id = ?) ORDER BY name",
            SELECT_ROUTER
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_router_row).collect())
    }

    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Router>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ROUTER))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_router_row))
    }

    pub async fn create(pool: &Pool<Sqlite>, tenant_id: Option<i64>, req: &CreateRouterRequest) -> Result<Router> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO routers (tenant_id, name, host, api_port, username, password, vendor, status,
                                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'unknown', ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(&req.name)
        .bind(&req.host)
        .bind(req.api_port as i64)
        .bind(&req.username)
        .bind(&req.password)
        .bind(req.vendor.clone().unwrap_or_else(|| "mikrotik".to_string()))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, result.last_insert_rowid())
            .await?
            .context("Router not found after creation")
    }

    pub async fn update_status(pool: &Pool<Sqlite>, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE routers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM routers WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Router", &id.to_string()).into());
        }
        Ok(())
    }
}
