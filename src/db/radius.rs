use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite, sqlite::SqliteRow};

use crate::models::*;

/// FreeRADIUS SQL store (radcheck/radreply/radacct), kept in its own database
#[derive(Clone)]
pub struct RadiusStore {
    pool: Pool<Sqlite>,
}

fn map_attribute_row(row: &SqliteRow) -> RadiusAttribute {
    RadiusAttribute {
        attribute: row.get("attribute"),
        op: row.get("op"),
        value: row.get("value"),
    }
}

fn map_accounting_row(row: &SqliteRow) -> AccountingRecord {
    AccountingRecord {
        id: row.get("radacctid"),
        acct_session_id: row.get("acctsessionid"),
        username: row.get("username"),
        nas_ip_address: row.get("nasipaddress"),
        framed_ip_address: row.get("framedipaddress"),
        calling_station_id: row.get("callingstationid"),
        start_time: row.get("acctstarttime"),
        update_time: row.get("acctupdatetime"),
        stop_time: row.get("acctstoptime"),
        session_time: row.get("acctsessiontime"),
        input_octets: row.get("acctinputoctets"),
        output_octets: row.get("acctoutputoctets"),
        terminate_cause: row.get("acctterminatecause"),
    }
}

impl RadiusStore {
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to RADIUS database")?;

        sqlx::migrate!("./radius_migrations")
            .run(&pool)
            .await
            .context("Failed to run RADIUS migrations")?;

        Ok(Self { pool })
    }

    /// Cheap liveness query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Replace the check and reply attribute sets of one user
    pub async fn replace_user(
        &self,
        username: &str,
        check: &[RadiusAttribute],
        reply: &[RadiusAttribute],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM radcheck WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM radreply WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?;
        for attr in check {
            sqlx::query("INSERT INTO radcheck (username, attribute, op, value) VALUES (?, ?, ?, ?)")
                .bind(username)
                .bind(&attr.attribute)
                .bind(&attr.op)
                .bind(&attr.value)
                .execute(&mut *tx)
                .await?;
        }
        for attr in reply {
            sqlx::query("INSERT INTO radreply (username, attribute, op, value) VALUES (?, ?, ?, ?)")
                .bind(username)
                .bind(&attr.attribute)
                .bind(&attr.op)
                .bind(&attr.value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_check(&self, username: &str, attr: &RadiusAttribute) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO radcheck (username, attribute, op, value) VALUES (?, ?, ?, ?)
            ON CONFLICT(username, attribute) DO UPDATE SET op = excluded.op, value = excluded.value
            "#,
        )
        .bind(username)
        .bind(&attr.attribute)
        .bind(&attr.op)
        .bind(&attr.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_check(&self, username: &str, attribute: &str) -> Result<()> {
        sqlx::query("DELETE FROM radcheck WHERE username = ? AND attribute = ?")
            .bind(username)
            .bind(attribute)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a user's check and reply rows. Accounting history is kept.
    pub async fn delete_user(&self, username: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let checks = sqlx::query("DELETE FROM radcheck WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM radreply WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(checks.rows_affected() > 0)
    }

    pub async fn check_attributes(&self, username: &str) -> Result<Vec<RadiusAttribute>> {
        let rows = sqlx::query("SELECT attribute, op, value FROM radcheck WHERE username = ? ORDER BY id")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_attribute_row).collect())
    }

    pub async fn reply_attributes(&self, username: &str) -> Result<Vec<RadiusAttribute>> {
        let rows = sqlx::query("SELECT attribute, op, value FROM radreply WHERE username = ? ORDER BY id")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_attribute_row).collect())
    }

    pub async fn accounting_start(&self, req: &AccountingRequest, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO radacct (acctsessionid, acctuniqueid, username, nasipaddress, nasportid, acctstarttime,
                                 acctupdatetime, callingstationid, framedipaddress)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(acctsessionid, username) DO UPDATE SET
                nasipaddress = excluded.nasipaddress,
                framedipaddress = excluded.framedipaddress,
                acctupdatetime = excluded.acctupdatetime
            "#,
        )
        .bind(&req.acct_session_id)
        .bind(format!("{}-{}", req.username, req.acct_session_id))
        .bind(&req.username)
        .bind(&req.nas_ip_address)
        .bind(req.nas_port_id.clone())
        .bind(at)
        .bind(at)
        .bind(&req.calling_station_id)
        .bind(&req.framed_ip_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Interim or stop update. Returns false when no session row matched.
    pub async fn accounting_update(
        &self,
        req: &AccountingRequest,
        at: DateTime<Utc>,
        stop: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE radacct SET acctsessiontime = ?, acctinputoctets = ?, acctoutputoctets = ?,
                               acctupdatetime = ?,
                               acctstoptime = CASE WHEN ? THEN ? ELSE acctstoptime END,
                               acctterminatecause = CASE WHEN ? THEN ? ELSE acctterminatecause END
            WHERE acctsessionid = ? AND username = ?
            "#,
        )
        .bind(req.session_time)
        .bind(req.input_octets)
        .bind(req.output_octets)
        .bind(at)
        .bind(stop)
        .bind(at)
        .bind(stop)
        .bind(&req.terminate_cause)
        .bind(&req.acct_session_id)
        .bind(&req.username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_session(&self, acct_session_id: &str, username: &str) -> Result<Option<AccountingRecord>> {
        let row = sqlx::query("SELECT * FROM radacct WHERE acctsessionid = ? AND username = ?")
            .bind(acct_session_id)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_accounting_row))
    }

    pub async fn open_sessions(&self, username: Option<&str>) -> Result<Vec<AccountingRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM radacct WHERE acctstoptime IS NULL AND (? IS NULL OR username = ?) ORDER BY acctstarttime DESC",
        )
        .bind(username)
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_accounting_row).collect())
    }

    pub async fn session_history(&self, username: &str, limit: i64) -> Result<Vec<AccountingRecord>> {
        let rows = sqlx::query("SELECT * FROM radacct WHERE username = ? ORDER BY acctstarttime DESC, radacctid DESC LIMIT ?")
            .bind(username)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_accounting_row).collect())
    }

    pub async fn usage(&self, username: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as sessions,
                   COALESCE(SUM(acctsessiontime), 0) as session_time,
                   COALESCE(SUM(acctinputoctets), 0) as input_octets,
                   COALESCE(SUM(acctoutputoctets), 0) as output_octets
            FROM radacct WHERE username = ? AND acctstarttime >= ? AND acctstarttime < ?
            "#,
        )
        .bind(username)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        let input_octets: i64 = row.get("input_octets");
        let output_octets: i64 = row.get("output_octets");
        Ok(UsageSummary {
            username: username.to_string(),
            sessions: row.get("sessions"),
            session_time: row.get("session_time"),
            input_octets,
            output_octets,
            total_octets: input_octets + output_octets,
        })
    }
}
