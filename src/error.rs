use thiserror::Error;
use uuid::Uuid;

use crate::models::ScanStatus;

/// Errors surfaced by scan lifecycle operations.
///
/// Per-cell scrape failures never show up here: they are recorded as cell
/// results and scrape events instead.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan {0} not found")]
    NotFound(Uuid),
    #[error("scan {id} is already {status}")]
    Conflict { id: Uuid, status: ScanStatus },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type ScanResult<T> = Result<T, ScanError>;
