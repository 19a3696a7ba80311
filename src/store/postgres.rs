//! Postgres-backed [`ScanStore`] / [`EventLog`].
//!
//! Counter updates and cancellation are single conditional statements so
//! overlapping resume callers can't push `completed` past `total` or revive
//! a terminal scan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{CancelOutcome, EventLog, ScanStore};
use crate::models::{CellResult, Hotel, Scan, ScrapeEvent};

const SCAN_COLUMNS: &str =
    "id, created_at, base_check_in, days, stay_nights, adults, total, completed, status";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self::new(pool))
    }
}

fn scan_from_row(row: &PgRow) -> Result<Scan> {
    let status: String = row.try_get("status")?;
    Ok(Scan {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        base_check_in: row.try_get("base_check_in")?,
        days: row.try_get::<i32, _>("days")? as u32,
        stay_nights: row.try_get::<i32, _>("stay_nights")? as u32,
        adults: row.try_get::<i32, _>("adults")? as u32,
        total: row.try_get::<i64, _>("total")? as u64,
        completed: row.try_get::<i64, _>("completed")? as u64,
        status: status.parse()?,
    })
}

fn hotel_from_row(row: &PgRow) -> Result<Hotel> {
    Ok(Hotel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_ref: row.try_get("source_ref")?,
    })
}

fn cell_from_row(row: &PgRow) -> Result<CellResult> {
    let status: String = row.try_get("status")?;
    Ok(CellResult {
        scan_id: row.try_get("scan_id")?,
        hotel_id: row.try_get("hotel_id")?,
        check_in: row.try_get("check_in")?,
        status: status.parse()?,
        payload: row.try_get("payload")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<ScrapeEvent> {
    let class: String = row.try_get("class")?;
    Ok(ScrapeEvent {
        at: row.try_get("at")?,
        scan_id: row.try_get("scan_id")?,
        hotel_id: row.try_get("hotel_id")?,
        url: row.try_get("url")?,
        class: class.parse()?,
        http_status: row.try_get::<Option<i32>, _>("http_status")?.map(|s| s as u16),
        delay_ms: row.try_get::<i64, _>("delay_ms")? as u64,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        error: row.try_get("error")?,
        user_agent: row.try_get("user_agent")?,
        reason: row.try_get("reason")?,
        latency_ms: row.try_get::<i64, _>("latency_ms")? as u64,
        session_id: row.try_get("session_id")?,
    })
}

#[async_trait]
impl ScanStore for PgStore {
    async fn list_hotels(&self) -> Result<Vec<Hotel>> {
        let rows = sqlx::query("SELECT id, name, source_ref FROM hotels WHERE active ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hotel_from_row).collect()
    }

    async fn add_hotel(&self, name: &str, source_ref: &str) -> Result<Hotel> {
        let row = sqlx::query(
            "INSERT INTO hotels (name, source_ref) VALUES ($1, $2) RETURNING id, name, source_ref",
        )
        .bind(name)
        .bind(source_ref)
        .fetch_one(&self.pool)
        .await?;
        hotel_from_row(&row)
    }

    async fn create_scan(&self, scan: &Scan, hotel_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO scans (id, created_at, base_check_in, days, stay_nights, adults,
                               total, completed, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(scan.id)
        .bind(scan.created_at)
        .bind(scan.base_check_in)
        .bind(scan.days as i32)
        .bind(scan.stay_nights as i32)
        .bind(scan.adults as i32)
        .bind(scan.total as i64)
        .bind(scan.completed as i64)
        .bind(scan.status.as_str())
        .execute(&mut *tx)
        .await?;

        for (ordinal, hotel_id) in hotel_ids.iter().enumerate() {
            sqlx::query("INSERT INTO scan_hotels (scan_id, ordinal, hotel_id) VALUES ($1, $2, $3)")
                .bind(scan.id)
                .bind(ordinal as i32)
                .bind(hotel_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        let row = sqlx::query(&format!("SELECT {} FROM scans WHERE id = $1", SCAN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn list_scans(&self, limit: usize) -> Result<Vec<Scan>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scans ORDER BY created_at DESC LIMIT $1",
            SCAN_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_from_row).collect()
    }

    async fn scan_hotels(&self, id: Uuid) -> Result<Vec<Hotel>> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.name, h.source_ref
            FROM scan_hotels sh
            JOIN hotels h ON h.id = sh.hotel_id
            WHERE sh.scan_id = $1
            ORDER BY sh.ordinal
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hotel_from_row).collect()
    }

    async fn oldest_resumable_scan(&self) -> Result<Option<Scan>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scans WHERE status = 'running' AND completed < total \
             ORDER BY created_at ASC LIMIT 1",
            SCAN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn add_completed(&self, id: Uuid, processed: u64) -> Result<Option<Scan>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE scans
            SET completed = LEAST(total, completed + $2),
                status = CASE
                    WHEN status = 'running' AND LEAST(total, completed + $2) >= total THEN 'done'
                    ELSE status
                END
            WHERE id = $1
            RETURNING {}
            "#,
            SCAN_COLUMNS
        ))
        .bind(id)
        .bind(processed as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn finish_if_complete(&self, id: Uuid) -> Result<Option<Scan>> {
        self.add_completed(id, 0).await
    }

    async fn cancel_scan(&self, id: Uuid) -> Result<CancelOutcome> {
        let row = sqlx::query(&format!(
            "UPDATE scans SET status = 'cancelled' \
             WHERE id = $1 AND status IN ('queued', 'running') RETURNING {}",
            SCAN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(CancelOutcome::Cancelled(scan_from_row(&row)?));
        }
        Ok(match self.get_scan(id).await? {
            Some(scan) => CancelOutcome::AlreadyTerminal(scan),
            None => CancelOutcome::NotFound,
        })
    }

    async fn fail_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        sqlx::query(
            "UPDATE scans SET status = 'error' WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_scan(id).await
    }

    async fn upsert_cell(&self, cell: &CellResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_cells (scan_id, hotel_id, check_in, status, payload, price,
                                    currency, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (scan_id, hotel_id, check_in) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                price = excluded.price,
                currency = excluded.currency,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(cell.scan_id)
        .bind(cell.hotel_id)
        .bind(cell.check_in)
        .bind(cell.status.as_str())
        .bind(&cell.payload)
        .bind(cell.price)
        .bind(&cell.currency)
        .bind(cell.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cells(&self, scan_id: Uuid) -> Result<Vec<CellResult>> {
        let rows = sqlx::query(
            r#"
            SELECT scan_id, hotel_id, check_in, status, payload, price, currency, updated_at
            FROM scan_cells
            WHERE scan_id = $1
            ORDER BY hotel_id, check_in
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cell_from_row).collect()
    }
}

const EVENT_COLUMNS: &str = "at, scan_id, hotel_id, url, class, http_status, delay_ms, \
     retry_count, error, user_agent, reason, latency_ms, session_id";

#[async_trait]
impl EventLog for PgStore {
    async fn append_event(&self, event: &ScrapeEvent) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO scrape_events ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            EVENT_COLUMNS
        ))
        .bind(event.at)
        .bind(event.scan_id)
        .bind(event.hotel_id)
        .bind(&event.url)
        .bind(event.class.as_str())
        .bind(event.http_status.map(|s| s as i32))
        .bind(event.delay_ms as i64)
        .bind(event.retry_count as i32)
        .bind(&event.error)
        .bind(&event.user_agent)
        .bind(&event.reason)
        .bind(event.latency_ms as i64)
        .bind(&event.session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScrapeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scrape_events WHERE scan_id = $1 ORDER BY id",
            EVENT_COLUMNS
        ))
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ScrapeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scrape_events WHERE at >= $1 ORDER BY id",
            EVENT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}
