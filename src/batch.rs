//! Processes one contiguous slice of a scan's flat index space.
//!
//! A fixed number of workers pull items off a shared atomic cursor. Before
//! each claim a worker checks the soft budget token; once it fires no new
//! item is started but in-flight scrapes and their upserts run to the end.
//! The scan's completed counter is touched exactly once, after every worker
//! has returned. When a health check is attached, the scan's event log is
//! evaluated against the thresholds after every batch and alerts are logged.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::enumerator::{self, WorkItem};
use crate::error::{ScanError, ScanResult};
use crate::metrics::{self, HealthAlert, HealthThresholds};
use crate::models::{CellResult, CellStatus, Hotel, Scan, ScanStatus};
use crate::scrape_client::{Occupancy, ScrapeRequest, Scraper};
use crate::store::{EventLog, ScanStore};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub soft_budget: Duration,
    /// Upper bound on a single slice regardless of what the caller asks for.
    pub max_size: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            soft_budget: Duration::from_secs(40),
            max_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub scan_id: Uuid,
    pub processed: u64,
    pub next_index: u64,
    pub done: bool,
    pub total: u64,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<HealthAlert>,
}

struct HealthCheck {
    events: Arc<dyn EventLog>,
    thresholds: HealthThresholds,
}

pub struct BatchProcessor {
    store: Arc<dyn ScanStore>,
    scraper: Arc<dyn Scraper>,
    config: BatchConfig,
    shutdown: CancellationToken,
    health: Option<HealthCheck>,
}

struct SliceRun<'a> {
    scan: &'a Scan,
    hotels: &'a [Hotel],
    items: Vec<WorkItem>,
    cursor: AtomicUsize,
    processed: AtomicU64,
    budget: CancellationToken,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn ScanStore>, scraper: Arc<dyn Scraper>, config: BatchConfig) -> Self {
        Self {
            store,
            scraper,
            config,
            shutdown: CancellationToken::new(),
            health: None,
        }
    }

    /// Process shutdown also ends the soft budget of any running batch.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Evaluates `thresholds` against the scan's events after every batch.
    pub fn with_health(mut self, events: Arc<dyn EventLog>, thresholds: HealthThresholds) -> Self {
        self.health = Some(HealthCheck { events, thresholds });
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn process_batch(
        &self,
        scan_id: Uuid,
        start: u64,
        size: u64,
    ) -> ScanResult<BatchOutcome> {
        if size == 0 {
            return Err(ScanError::InvalidParams(
                "batch size must be positive".to_string(),
            ));
        }
        let scan = self
            .store
            .get_scan(scan_id)
            .await?
            .ok_or(ScanError::NotFound(scan_id))?;

        if scan.status != ScanStatus::Running {
            debug!("Scan {} is {}, nothing to process", scan_id, scan.status);
            return Ok(settled(&scan, start.min(scan.total), 0));
        }

        let range = enumerator::clamp_slice(scan.total, start, size.min(self.config.max_size));
        if range.is_empty() {
            let scan = self
                .store
                .finish_if_complete(scan_id)
                .await?
                .unwrap_or(scan);
            return Ok(settled(&scan, range.end, 0));
        }

        let hotels = self.store.scan_hotels(scan_id).await?;
        if hotels.len() as u64 * scan.days as u64 != scan.total {
            error!(
                "Scan {} expects {} cells but its hotel snapshot has {} hotels x {} days; failing scan",
                scan_id,
                scan.total,
                hotels.len(),
                scan.days
            );
            let scan = self.store.fail_scan(scan_id).await?.unwrap_or(scan);
            return Ok(settled(&scan, range.end, 0));
        }

        let started = Instant::now();
        let processed = self.run_slice(&scan, &hotels, range.clone()).await;

        let updated = self
            .store
            .add_completed(scan_id, processed)
            .await?
            .ok_or(ScanError::NotFound(scan_id))?;
        let requested = range.end - range.start;
        if processed < requested {
            warn!(
                "Scan {}: soft budget cut slice {}..{} short at {}/{} cells",
                scan_id, range.start, range.end, processed, requested
            );
        }
        info!(
            "Scan {}: processed {} cells of {}..{} in {:.1}s, {}/{} complete ({})",
            scan_id,
            processed,
            range.start,
            range.end,
            started.elapsed().as_secs_f64(),
            updated.completed,
            updated.total,
            updated.status
        );

        Ok(BatchOutcome {
            scan_id,
            processed,
            next_index: range.end,
            done: updated.status == ScanStatus::Done,
            total: updated.total,
            status: updated.status,
            alerts: self.check_health(scan_id).await,
        })
    }

    /// Alerts are logged by the report; a failed read only costs the check.
    async fn check_health(&self, scan_id: Uuid) -> Vec<HealthAlert> {
        let Some(health) = &self.health else {
            return Vec::new();
        };
        match metrics::scan_report(health.events.as_ref(), scan_id, &health.thresholds).await {
            Ok(report) => report.alerts,
            Err(e) => {
                warn!("Scan {}: health check failed: {:#}", scan_id, e);
                Vec::new()
            }
        }
    }

    async fn run_slice(&self, scan: &Scan, hotels: &[Hotel], range: Range<u64>) -> u64 {
        let budget = self.shutdown.child_token();
        // Dropping the guard ends the timer task once the pool has drained.
        let _guard = budget.clone().drop_guard();
        let timer = budget.clone();
        let soft_budget = self.config.soft_budget;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(soft_budget) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });

        let run = SliceRun {
            scan,
            hotels,
            items: enumerator::slice(scan.days, range).collect(),
            cursor: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            budget,
        };
        let workers = self.config.concurrency.max(1);
        join_all((0..workers).map(|worker| self.run_worker(&run, worker))).await;
        run.processed.load(Ordering::SeqCst)
    }

    async fn run_worker(&self, run: &SliceRun<'_>, worker: usize) {
        loop {
            if run.budget.is_cancelled() {
                debug!("Worker {} stops claiming: budget spent", worker);
                return;
            }
            let claimed = run.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(item) = run.items.get(claimed) else {
                return;
            };
            if self.process_item(run, item).await {
                run.processed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Scrapes and persists one cell. Returns whether the cell was stored.
    async fn process_item(&self, run: &SliceRun<'_>, item: &WorkItem) -> bool {
        let scan = run.scan;
        let Some(hotel) = run.hotels.get(item.hotel_ordinal) else {
            error!("Scan {}: index {} has no hotel", scan.id, item.index);
            return false;
        };
        let check_in = scan.check_in_for(item.date_ordinal);
        let request = ScrapeRequest {
            scan_id: Some(scan.id),
            hotel: hotel.clone(),
            check_in,
            check_out: scan.check_out_for(check_in),
            occupancy: Occupancy {
                adults: scan.adults,
                children: 0,
            },
        };

        let outcome = self.scraper.scrape(&request).await;
        let status = outcome.status.cell_status();
        let mut payload = outcome.payload;
        if let Some(message) = &outcome.error_message {
            warn!(
                "Scan {}: {} on {} is {:?}: {}",
                scan.id, hotel.name, check_in, outcome.status, message
            );
            if let Some(map) = payload.as_object_mut() {
                map.insert("error".to_string(), json!(message));
            }
        }
        if let Some(map) = payload.as_object_mut() {
            map.insert("outcome".to_string(), json!(outcome.status));
        }

        let cell = CellResult {
            scan_id: scan.id,
            hotel_id: hotel.id,
            check_in,
            status,
            payload,
            price: if status == CellStatus::Green {
                outcome.price
            } else {
                None
            },
            currency: outcome.currency,
            updated_at: Utc::now(),
        };
        match self.store.upsert_cell(&cell).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Scan {}: failed to store cell {} / {}: {:#}",
                    scan.id, hotel.id, check_in, e
                );
                false
            }
        }
    }
}

fn settled(scan: &Scan, next_index: u64, processed: u64) -> BatchOutcome {
    BatchOutcome {
        scan_id: scan.id,
        processed,
        next_index,
        done: true,
        total: scan.total,
        status: scan.status,
        alerts: Vec::new(),
    }
}
