//! Scan lifecycle: create, resume, cancel, and the scheduler loop that keeps
//! calling resume until there is nothing left to do.
//!
//! The first-batch kick at creation, the scheduler loop and any external
//! `/resume` caller share one lock, and each batch starts from the scan's
//! persisted `completed` count as read under that lock.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchProcessor};
use crate::error::{ScanError, ScanResult};
use crate::models::{NewScan, Scan};
use crate::store::{CancelOutcome, ScanStore};

pub const MAX_DAYS: u32 = 366;
pub const MAX_STAY_NIGHTS: u32 = 30;
pub const MAX_ADULTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: u64,
    pub resume_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            resume_interval: Duration::from_secs(60),
        }
    }
}

/// Response body for a freshly created scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedScan {
    pub scan_id: Uuid,
    pub total_cells: u64,
    pub base_check_in: chrono::NaiveDate,
    pub days: u32,
    pub stay_nights: u32,
}

impl From<&Scan> for CreatedScan {
    fn from(scan: &Scan) -> Self {
        Self {
            scan_id: scan.id,
            total_cells: scan.total,
            base_check_in: scan.base_check_in,
            days: scan.days,
            stay_nights: scan.stay_nights,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResumeOutcome {
    Idle { message: String },
    Processed(BatchOutcome),
}

pub struct Orchestrator {
    store: Arc<dyn ScanStore>,
    batch: Arc<BatchProcessor>,
    config: OrchestratorConfig,
    resume_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ScanStore>,
        batch: Arc<BatchProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            batch,
            config,
            resume_lock: Mutex::new(()),
        }
    }

    pub fn batch(&self) -> &BatchProcessor {
        &self.batch
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validates `params`, freezes the current hotel list and stores a
    /// `running` scan with nothing completed.
    pub async fn create_scan(&self, params: &NewScan) -> ScanResult<Scan> {
        validate(params)?;
        let hotels = self.store.list_hotels().await?;
        if hotels.is_empty() {
            return Err(ScanError::InvalidParams(
                "no active hotels to scan".to_string(),
            ));
        }
        let hotel_ids: Vec<i64> = hotels.iter().map(|h| h.id).collect();
        let scan = Scan::new(params, hotels.len());
        self.store.create_scan(&scan, &hotel_ids).await?;
        info!(
            "Created scan {}: {} hotels x {} days from {} ({} nights), {} cells",
            scan.id,
            hotels.len(),
            scan.days,
            scan.base_check_in,
            scan.stay_nights,
            scan.total
        );
        Ok(scan)
    }

    /// Creates a scan and processes its first batch in the background.
    pub async fn start_scan(self: &Arc<Self>, params: &NewScan) -> ScanResult<Scan> {
        let scan = self.create_scan(params).await?;
        self.kick_first_batch(scan.id);
        Ok(scan)
    }

    /// Runs one batch of `scan_id` in the background, serialised with resume
    /// cycles and starting from whatever the scan has completed by then.
    pub fn kick_first_batch(self: &Arc<Self>, scan_id: Uuid) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run_locked_batch(scan_id).await {
                Ok(outcome) => info!(
                    "First batch of scan {}: {} processed, next index {}",
                    scan_id, outcome.processed, outcome.next_index
                ),
                Err(e) => warn!("First batch of scan {} failed: {}", scan_id, e),
            }
        })
    }

    async fn run_locked_batch(&self, scan_id: Uuid) -> ScanResult<BatchOutcome> {
        let _cycle = self.resume_lock.lock().await;
        let scan = self.get_scan(scan_id).await?;
        self.batch
            .process_batch(scan.id, scan.completed, self.config.batch_size)
            .await
    }

    /// One resume cycle: picks the oldest unfinished running scan and runs a
    /// single batch from its completed count.
    pub async fn resume_once(&self) -> ScanResult<ResumeOutcome> {
        let _cycle = self.resume_lock.lock().await;
        let Some(scan) = self.store.oldest_resumable_scan().await? else {
            return Ok(ResumeOutcome::Idle {
                message: "no running scans".to_string(),
            });
        };
        info!(
            "Resuming scan {} at {}/{}",
            scan.id, scan.completed, scan.total
        );
        let outcome = self
            .batch
            .process_batch(scan.id, scan.completed, self.config.batch_size)
            .await?;
        Ok(ResumeOutcome::Processed(outcome))
    }

    pub async fn cancel(&self, scan_id: Uuid) -> ScanResult<Scan> {
        match self.store.cancel_scan(scan_id).await? {
            CancelOutcome::Cancelled(scan) => {
                info!("Cancelled scan {} at {}/{}", scan.id, scan.completed, scan.total);
                Ok(scan)
            }
            CancelOutcome::AlreadyTerminal(scan) => Err(ScanError::Conflict {
                id: scan.id,
                status: scan.status,
            }),
            CancelOutcome::NotFound => Err(ScanError::NotFound(scan_id)),
        }
    }

    pub async fn get_scan(&self, scan_id: Uuid) -> ScanResult<Scan> {
        self.store
            .get_scan(scan_id)
            .await?
            .ok_or(ScanError::NotFound(scan_id))
    }

    /// Runs resume cycles until `shutdown` fires. A cycle that made progress
    /// on an unfinished scan is followed immediately by the next one;
    /// otherwise the loop sleeps for the resume interval.
    pub async fn run_scheduler(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler started: batch size {}, idle interval {:?}",
            self.config.batch_size, self.config.resume_interval
        );
        loop {
            let chain = match self.resume_once().await {
                Ok(ResumeOutcome::Processed(outcome)) => !outcome.done && outcome.processed > 0,
                Ok(ResumeOutcome::Idle { .. }) => false,
                Err(e) => {
                    error!("Resume cycle failed: {}", e);
                    false
                }
            };
            if shutdown.is_cancelled() {
                break;
            }
            if chain {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.resume_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Scheduler stopped");
    }
}

fn validate(params: &NewScan) -> ScanResult<()> {
    let check = |ok: bool, message: String| {
        if ok {
            Ok(())
        } else {
            Err(ScanError::InvalidParams(message))
        }
    };
    check(
        (1..=MAX_DAYS).contains(&params.days),
        format!("days must be between 1 and {}", MAX_DAYS),
    )?;
    check(
        (1..=MAX_STAY_NIGHTS).contains(&params.stay_nights),
        format!("stayNights must be between 1 and {}", MAX_STAY_NIGHTS),
    )?;
    check(
        (1..=MAX_ADULTS).contains(&params.adults),
        format!("adults must be between 1 and {}", MAX_ADULTS),
    )?;
    // The last check-out must still be a representable date.
    let span = chrono::Duration::days(i64::from(params.days) - 1 + i64::from(params.stay_nights));
    check(
        params.base_check_in.checked_add_signed(span).is_some(),
        "baseCheckIn is too far in the future".to_string(),
    )
}
