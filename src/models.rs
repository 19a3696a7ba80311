use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a scan. `done`, `error` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Done => "done",
            ScanStatus::Error => "error",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Done | ScanStatus::Error | ScanStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, ScanStatus::Queued | ScanStatus::Running)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "running" => Ok(ScanStatus::Running),
            "done" => Ok(ScanStatus::Done),
            "error" => Ok(ScanStatus::Error),
            "cancelled" => Ok(ScanStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown scan status: {}", other)),
        }
    }
}

/// A hotel as seen by the scanner. `source_ref` is either a path relative to
/// the source base URL or the source's own absolute listing URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotel {
    pub id: i64,
    pub name: String,
    pub source_ref: String,
}

/// Parameters accepted when a scan is requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScan {
    pub base_check_in: NaiveDate,
    pub days: u32,
    pub stay_nights: u32,
    #[serde(default = "default_adults")]
    pub adults: u32,
}

fn default_adults() -> u32 {
    2
}

/// One run over the full hotel x date grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub base_check_in: NaiveDate,
    pub days: u32,
    pub stay_nights: u32,
    pub adults: u32,
    pub total: u64,
    pub completed: u64,
    pub status: ScanStatus,
}

impl Scan {
    pub fn new(params: &NewScan, hotel_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            base_check_in: params.base_check_in,
            days: params.days,
            stay_nights: params.stay_nights,
            adults: params.adults,
            total: hotel_count as u64 * params.days as u64,
            completed: 0,
            status: ScanStatus::Running,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.status == ScanStatus::Running && self.completed < self.total
    }

    pub fn check_in_for(&self, date_ordinal: u32) -> NaiveDate {
        self.base_check_in + Duration::days(date_ordinal as i64)
    }

    pub fn check_out_for(&self, check_in: NaiveDate) -> NaiveDate {
        check_in + Duration::days(self.stay_nights as i64)
    }
}

/// Availability signal stored per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Green,
    Red,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Green => "green",
            CellStatus::Red => "red",
        }
    }
}

impl FromStr for CellStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(CellStatus::Green),
            "red" => Ok(CellStatus::Red),
            other => Err(anyhow::anyhow!("unknown cell status: {}", other)),
        }
    }
}

/// Outcome for one (scan, hotel, check-in) key. Upserted, never duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub scan_id: Uuid,
    pub hotel_id: i64,
    pub check_in: NaiveDate,
    pub status: CellStatus,
    pub payload: serde_json::Value,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Classification attached to every scrape attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Success,
    Error,
    Timeout,
    Block,
    ManualReview,
}

impl EventClass {
    pub const ALL: [EventClass; 5] = [
        EventClass::Success,
        EventClass::Error,
        EventClass::Timeout,
        EventClass::Block,
        EventClass::ManualReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Success => "success",
            EventClass::Error => "error",
            EventClass::Timeout => "timeout",
            EventClass::Block => "block",
            EventClass::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(EventClass::Success),
            "error" => Ok(EventClass::Error),
            "timeout" => Ok(EventClass::Timeout),
            "block" => Ok(EventClass::Block),
            "manual_review" => Ok(EventClass::ManualReview),
            other => Err(anyhow::anyhow!("unknown event class: {}", other)),
        }
    }
}

/// Append-only record of a single scrape attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeEvent {
    pub at: DateTime<Utc>,
    pub scan_id: Option<Uuid>,
    pub hotel_id: Option<i64>,
    pub url: String,
    pub class: EventClass,
    pub http_status: Option<u16>,
    pub delay_ms: u64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub user_agent: String,
    pub reason: String,
    pub latency_ms: u64,
    pub session_id: String,
}
