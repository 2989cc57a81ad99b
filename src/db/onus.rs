use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

use crate::models::*;

use super::row_helpers::map_onu_row;

const SELECT_ONU: &str = r#"
    SELECT id, tenant_id, olt_id, serial_number, pon_port, onu_id, status, auth_state, signal_rx,
           signal_tx, distance, network_user_id, last_seen_at, last_status_at, created_at, updated_at
    FROM onus
"#;

/// Per-OLT ONU counts
#[derive(Debug, Clone, Copy, Default)]
pub struct OnuCounts {
    pub total: i64,
    pub online: i64,
    pub offline: i64,
}

/// ONU registry operations
pub struct OnuRepo;

impl OnuRepo {
    pub async fn list_by_olt(pool: &Pool<Sqlite>, olt_id: i64) -> Result<Vec<Onu>> {
        let rows = sqlx::query(&format!("{} WHERE olt_id = ? ORDER BY pon_port, onu_id", SELECT_ONU))
            .bind(olt_id)
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(map_onu_row).collect())
    }

    pub async fn get(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Onu>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ONU))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_onu_row))
    }

    pub async fn list_in(conn: &mut SqliteConnection, olt_id: i64) -> Result<Vec<Onu>> {
        let rows = sqlx::query(&format!("{} WHERE olt_id = ?", SELECT_ONU))
            .bind(olt_id)
            .fetch_all(conn)
            .await?;
        Ok(rows.iter().map(map_onu_row).collect())
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        olt: &Olt,
        onu: &DiscoveredOnu,
        seen_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO onus (tenant_id, olt_id, serial_number, pon_port, onu_id, status, auth_state,
                              signal_rx, signal_tx, distance, last_seen_at, last_status_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'discovered', ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(olt.tenant_id)
        .bind(olt.id)
        .bind(&onu.serial_number)
        .bind(&onu.pon_port)
        .bind(onu.onu_id)
        .bind(&onu.status)
        .bind(onu.signal_rx)
        .bind(onu.signal_tx)
        .bind(onu.distance)
        .bind(seen_at)
        .bind(seen_at)
        .bind(seen_at)
        .bind(seen_at)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Refresh an existing row from a discovery record, moving it if the port mapping changed
    pub async fn update_from_discovery(
        conn: &mut SqliteConnection,
        id: i64,
        onu: &DiscoveredOnu,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE onus SET serial_number = ?, pon_port = ?, onu_id = ?, status = ?, signal_rx = ?,
                            signal_tx = ?, distance = ?, last_seen_at = ?, last_status_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&onu.serial_number)
        .bind(&onu.pon_port)
        .bind(onu.onu_id)
        .bind(&onu.status)
        .bind(onu.signal_rx)
        .bind(onu.signal_tx)
        .bind(onu.distance)
        .bind(seen_at)
        .bind(seen_at)
        .bind(seen_at)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Free a slot taken over by another serial. The row keeps its links and
    /// history under a negative position unique to it.
    pub async fn move_out_of_slot(conn: &mut SqliteConnection, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE onus SET onu_id = -id, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Rows are never deleted by sync; absence only flips status
    pub async fn mark_offline(conn: &mut SqliteConnection, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE onus SET status = 'offline', signal_rx = NULL, signal_tx = NULL, last_status_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        pool: &Pool<Sqlite>,
        id: i64,
        status: &str,
        signal_rx: Option<f64>,
        signal_tx: Option<f64>,
        distance: Option<i64>,
    ) -> Result<Onu> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE onus SET status = ?, signal_rx = ?, signal_tx = ?, distance = COALESCE(?, distance),
                            last_seen_at = CASE WHEN ? = 'online' THEN ? ELSE last_seen_at END,
                            last_status_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(signal_rx)
        .bind(signal_tx)
        .bind(distance)
        .bind(status)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        Self::get(pool, id)
            .await?
            .context("ONU not found after status update")
    }

    pub async fn set_auth_state(pool: &Pool<Sqlite>, id: i64, auth_state: &str) -> Result<()> {
        let result = sqlx::query("UPDATE onus SET auth_state = ?, updated_at = ? WHERE id = ?")
            .bind(auth_state)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("ONU", &id.to_string()).into());
        }
        Ok(())
    }

    pub async fn link_network_user(pool: &Pool<Sqlite>, id: i64, network_user_id: Option<i64>) -> Result<Onu> {
        let result = sqlx::query("UPDATE onus SET network_user_id = ?, updated_at = ? WHERE id = ?")
            .bind(network_user_id)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("ONU", &id.to_string()).into());
        }
        Self::get(pool, id)
            .await?
            .context("ONU not found after link")
    }

    pub async fn counts(pool: &Pool<Sqlite>, olt_id: i64) -> Result<OnuCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as total,
                   COALESCE(SUM(CASE WHEN status = 'online' THEN 1 ELSE 0 END), 0) as online,
                   COALESCE(SUM(CASE WHEN status = 'offline' THEN 1 ELSE 0 END), 0) as offline
            FROM onus WHERE olt_id = ?
            "#,
        )
        .bind(olt_id)
        .fetch_one(pool)
        .await?;
        Ok(OnuCounts {
            total: row.get("total"),
            online: row.get("online"),
            offline: row.get("offline"),
        })
    }
}
