use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

use crate::models::*;

use super::row_helpers::{map_bandwidth_row, map_monitor_row};

const SELECT_MONITOR: &str = r#"
    SELECT id, device_type, device_id, status, consecutive_failures, cpu_usage, memory_usage,
           uptime_seconds, last_error, last_check_at
    FROM device_monitors
"#;

/// One raw or rolled-up bandwidth row
#[derive(Debug, Clone)]
pub struct BandwidthRow {
    pub id: i64,
    pub device_type: String,
    pub device_id: i64,
    pub period_start: DateTime<Utc>,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub samples: i64,
}

/// Device monitor and bandwidth bucket operations
pub struct MonitorRepo;

impl MonitorRepo {
    pub async fn get(pool: &Pool<Sqlite>, device_type: &str, device_id: i64) -> Result<Option<DeviceMonitor>> {
        let row = sqlx::query(&format!("{} WHERE device_type = ? AND device_id = ?", SELECT_MONITOR))
            .bind(device_type)
            .bind(device_id)
            .fetch_optional(pool)
            .await?;
        Ok(row.as_ref().map(map_monitor_row))
    }

    pub async fn list(pool: &Pool<Sqlite>) -> Result<Vec<DeviceMonitor>> {
        let rows = sqlx::query(&format!("{} ORDER BY device_type, device_id", SELECT_MONITOR))
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(map_monitor_row).collect())
    }

    /// A successful poll resets the failure streak
    pub async fn record_success(
        pool: &Pool<Sqlite>,
        device_type: &str,
        device_id: i64,
        status: &str,
        health: &DeviceHealth,
    ) -> Result<DeviceMonitor> {
        sqlx::query(
            r#"
            INSERT INTO device_monitors (device_type, device_id, status, consecutive_failures, cpu_usage,
                                         memory_usage, uptime_seconds, last_error, last_check_at)
            VALUES (?, ?, ?, 0, ?, ?, ?, '', ?)
            ON CONFLICT(device_type, device_id) DO UPDATE SET
                status = excluded.status,
                consecutive_failures = 0,
                cpu_usage = excluded.cpu_usage,
                memory_usage = excluded.memory_usage,
                uptime_seconds = excluded.uptime_seconds,
                last_error = '',
                last_check_at = excluded.last_check_at
            "#,
        )
        .bind(device_type)
        .bind(device_id)
        .bind(status)
        .bind(health.cpu_usage)
        .bind(health.memory_usage)
        .bind(health.uptime_seconds)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::get(pool, device_type, device_id)
            .await?
            .context("Monitor not found after upsert")
    }

    /// Increment the failure streak; `threshold` consecutive failures flip the device to unreachable
    pub async fn record_failure(
        pool: &Pool<Sqlite>,
        device_type: &str,
        device_id: i64,
        error: &str,
        threshold: i64,
    ) -> Result<DeviceMonitor> {
        sqlx::query(
            r#"
            INSERT INTO device_monitors (device_type, device_id, status, consecutive_failures, last_error, last_check_at)
            VALUES (?, ?, CASE WHEN ? <= 1 THEN 'unreachable' ELSE 'unknown' END, 1, ?, ?)
            ON CONFLICT(device_type, device_id) DO UPDATE SET
                consecutive_failures = consecutive_failures + 1,
                status = CASE WHEN consecutive_failures + 1 >= ? THEN 'unreachable'
                              WHEN status = 'online' THEN 'degraded'
                              ELSE status END,
                last_error = excluded.last_error,
                last_check_at = excluded.last_check_at
            "#,
        )
        .bind(device_type)
        .bind(device_id)
        .bind(threshold)
        .bind(error)
        .bind(Utc::now())
        .bind(threshold)
        .execute(pool)
        .await?;

        Self::get(pool, device_type, device_id)
            .await?
            .context("Monitor not found after failure")
    }

    pub async fn insert_bandwidth(
        pool: &Pool<Sqlite>,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        period_start: DateTime<Utc>,
        upload_bytes: i64,
        download_bytes: i64,
        samples: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bandwidth_usage (device_type, device_id, period_type, period_start,
                                         upload_bytes, download_bytes, total_bytes, samples)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_type)
        .bind(device_id)
        .bind(period_type)
        .bind(period_start)
        .bind(upload_bytes)
        .bind(download_bytes)
        .bind(upload_bytes + download_bytes)
        .bind(samples)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Rows of one granularity older than `before`
    pub async fn bandwidth_rows_before(
        pool: &Pool<Sqlite>,
        period_type: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<BandwidthRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_type, device_id, period_start, upload_bytes, download_bytes, samples
            FROM bandwidth_usage WHERE period_type = ? AND period_start < ?
            ORDER BY device_type, device_id, period_start
            "#,
        )
        .bind(period_type)
        .bind(before)
        .fetch_all(pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| BandwidthRow {
                id: r.get("id"),
                device_type: r.get("device_type"),
                device_id: r.get("device_id"),
                period_start: r.get("period_start"),
                upload_bytes: r.get("upload_bytes"),
                download_bytes: r.get("download_bytes"),
                samples: r.get("samples"),
            })
            .collect())
    }

    /// Fold source rows into one bucket and delete them, atomically.
    /// An existing bucket for the same period is merged into.
    pub async fn merge_bucket(
        pool: &Pool<Sqlite>,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        period_start: DateTime<Utc>,
        sources: &[BandwidthRow],
    ) -> Result<()> {
        let upload: i64 = sources.iter().map(|s| s.upload_bytes).sum();
        let download: i64 = sources.iter().map(|s| s.download_bytes).sum();
        let samples: i64 = sources.iter().map(|s| s.samples).sum();

        let mut tx = pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id FROM bandwidth_usage WHERE device_type = ? AND device_id = ? AND period_type = ? AND period_start = ?",
        )
        .bind(device_type)
        .bind(device_id)
        .bind(period_type)
        .bind(period_start)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                sqlx::query(
                    r#"
                    UPDATE bandwidth_usage SET upload_bytes = upload_bytes + ?, download_bytes = download_bytes + ?,
                           total_bytes = total_bytes + ?, samples = samples + ?
                    WHERE id = ?
                    "#,
                )
                .bind(upload)
                .bind(download)
                .bind(upload + download)
                .bind(samples)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO bandwidth_usage (device_type, device_id, period_type, period_start,
                                                 upload_bytes, download_bytes, total_bytes, samples)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(device_type)
                .bind(device_id)
                .bind(period_type)
                .bind(period_start)
                .bind(upload)
                .bind(download)
                .bind(upload + download)
                .bind(samples)
                .execute(&mut *tx)
                .await?;
            }
        }

        for source in sources {
            sqlx::query("DELETE FROM bandwidth_usage WHERE id = ?")
                .bind(source.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn bandwidth_points(
        pool: &Pool<Sqlite>,
        device_type: &str,
        device_id: i64,
        period_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BandwidthPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT period_start, upload_bytes, download_bytes, total_bytes, samples
            FROM bandwidth_usage
            WHERE device_type = ? AND device_id = ? AND period_type = ? AND period_start >= ? AND period_start < ?
            ORDER BY period_start
            "#,
        )
        .bind(device_type)
        .bind(device_id)
        .bind(period_type)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(map_bandwidth_row).collect())
    }
}
