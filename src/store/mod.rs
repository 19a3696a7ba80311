//! Persistence boundary for scans, cells and scrape events.
//!
//! The scheduler only depends on these traits. [`postgres::PgStore`] is the
//! production backend; [`memory::InMemoryStore`] backs tests and dry runs.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_scan`](ScanStore::create_scan) | Store a scan and freeze its hotel snapshot |
//! | [`oldest_resumable_scan`](ScanStore::oldest_resumable_scan) | Resume-cycle selection |
//! | [`add_completed`](ScanStore::add_completed) | Atomic add-and-cap, flips `running -> done` |
//! | [`cancel_scan`](ScanStore::cancel_scan) | Conditional `queued/running -> cancelled` |
//! | [`upsert_cell`](ScanStore::upsert_cell) | Idempotent write per (scan, hotel, date) |

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CellResult, Hotel, Scan, ScrapeEvent};

/// Result of a conditional cancel.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Scan),
    AlreadyTerminal(Scan),
    NotFound,
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Active hotels in stable id order.
    async fn list_hotels(&self) -> Result<Vec<Hotel>>;

    async fn add_hotel(&self, name: &str, source_ref: &str) -> Result<Hotel>;

    /// Persists `scan` together with the ordered hotel snapshot it was sized for.
    async fn create_scan(&self, scan: &Scan, hotel_ids: &[i64]) -> Result<()>;

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>>;

    /// Most recent first.
    async fn list_scans(&self, limit: usize) -> Result<Vec<Scan>>;

    /// The frozen, ordered hotel list the scan enumerates over.
    async fn scan_hotels(&self, id: Uuid) -> Result<Vec<Hotel>>;

    /// Oldest scan with `status = running AND completed < total`.
    async fn oldest_resumable_scan(&self) -> Result<Option<Scan>>;

    /// Adds `processed` to `completed`, capped at `total`, and moves a
    /// running scan to `done` once it is full. Returns the updated scan.
    async fn add_completed(&self, id: Uuid, processed: u64) -> Result<Option<Scan>>;

    /// Moves a running scan to `done` if `completed == total`.
    async fn finish_if_complete(&self, id: Uuid) -> Result<Option<Scan>>;

    async fn cancel_scan(&self, id: Uuid) -> Result<CancelOutcome>;

    /// Sets a terminal failure status; ignored for scans already terminal.
    async fn fail_scan(&self, id: Uuid) -> Result<Option<Scan>>;

    async fn upsert_cell(&self, cell: &CellResult) -> Result<()>;

    async fn list_cells(&self, scan_id: Uuid) -> Result<Vec<CellResult>>;
}

/// Append-only record of scrape attempts.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append_event(&self, event: &ScrapeEvent) -> Result<()>;

    async fn events_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScrapeEvent>>;

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ScrapeEvent>>;
}
