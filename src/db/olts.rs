use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::models::*;

use super::row_helpers::{map_backup_row, map_olt_row};

const SELECT_OLT: &str = r#"
    SELECT id, tenant_id, name, ip_address, brand, model, vendor, management_protocol, ssh_port,
           username, password, snmp_community, snmp_port, pon_port_count, max_onus, status,
           uptime_seconds, temperature, cpu_usage, memory_usage, last_polled_at, last_sync_at,
           created_at, updated_at
    FROM olts
"#;

/// OLT descriptor operations
pub struct OltRepo;

impl OltRepo {
    pub async fn list(pool: &Pool<Sqlite>, scope: &TenantScope) -> Result<Vec<Olt>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR tenant_id = ?) ORDER BY name",
            SELECT_OLT
        ))
        .bind(scope.tenant_id)
        .bind(scope.tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_olt_row).collect())
    }

    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Olt>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_OLT))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_olt_row))
    }

    /// `vendor` is resolved by the caller once and cached on the row
    pub async fn create(pool: &Pool<Sqlite>, tenant_id: Option<i64>, req: &CreateOltRequest, vendor: &str) -> Result<Olt> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO olts (tenant_id, name, ip_address, brand, model, vendor, management_protocol, ssh_port,
                              username, password, snmp_community, snmp_port, pon_port_count, max_onus,
                              status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'unknown', ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(&req.name)
        .bind(&req.ip_address)
        .bind(&req.brand)
        .bind(&req.model)
        .bind(vendor)
        .bind(req.management_protocol.clone().unwrap_or_else(|| management_protocol::SNMP.to_string()))
        .bind(req.ssh_port.unwrap_or(22) as i64)
        .bind(&req.username)
        .bind(&req.password)
        .bind(req.snmp_community.clone().unwrap_or_else(|| "public".to_string()))
        .bind(req.snmp_port.unwrap_or(161) as i64)
        .bind(req.pon_port_count.unwrap_or(8))
        .bind(req.max_onus.unwrap_or(128))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, result.last_insert_rowid())
            .await?
            .context("OLT not found after creation")
    }

    pub async fn update_status(pool: &Pool<Sqlite>, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE olts SET status = ?, last_polled_at = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Store polled gauges. Missing values keep their previous reading.
    pub async fn update_health(pool: &Pool<Sqlite>, id: i64, health: &DeviceHealth) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE olts SET uptime_seconds = COALESCE(?, uptime_seconds),
                            temperature = COALESCE(?, temperature),
                            cpu_usage = COALESCE(?, cpu_usage),
                            memory_usage = COALESCE(?, memory_usage),
                            status = 'online', last_polled_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(health.uptime_seconds)
        .bind(health.temperature)
        .bind(health.cpu_usage)
        .bind(health.memory_usage)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn touch_sync(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
        sqlx::query("UPDATE olts SET last_sync_at = ?, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn create_backup(pool: &Pool<Sqlite>, olt_id: i64, filename: &str, size: i64) -> Result<OltBackup> {
        let result = sqlx::query(
            "INSERT INTO olt_backups (olt_id, filename, size, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(olt_id)
        .bind(filename)
        .bind(size)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::get_backup(pool, result.last_insert_rowid())
            .await?
            .context("Backup not found after creation")
    }

    pub async fn get_backup(pool: &Pool<Sqlite>, id: i64) -> Result<Option<OltBackup>> {
        let row = sqlx::query("SELECT * FROM olt_backups WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_backup_row))
    }

    pub async fn list_backups(pool: &Pool<Sqlite>, olt_id: i64) -> Result<Vec<OltBackup>> {
        let rows = sqlx::query("SELECT * FROM olt_backups WHERE olt_id = ? ORDER BY created_at DESC, id DESC")
            .bind(olt_id)
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(map_backup_row).collect())
    }

    pub async fn record_config_apply(pool: &Pool<Sqlite>, olt_id: i64, commands: &[String], result: &ConfigApplyResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO olt_config_history (olt_id, commands, output, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(olt_id)
        .bind(commands.join("\n"))
        .bind(&result.output)
        .bind(result.success)
        .bind(result.error.clone().unwrap_or_default())
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}
