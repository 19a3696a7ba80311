//! In-memory [`ScanStore`] / [`EventLog`] for tests and dry runs.
//!
//! Every operation takes the single state lock, which makes add-and-cap and
//! conditional cancel atomic the same way the SQL statements are.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::{CancelOutcome, EventLog, ScanStore};
use crate::models::{CellResult, Hotel, Scan, ScanStatus, ScrapeEvent};

#[derive(Default)]
struct State {
    hotels: BTreeMap<i64, Hotel>,
    next_hotel_id: i64,
    scans: HashMap<Uuid, Scan>,
    snapshots: HashMap<Uuid, Vec<i64>>,
    cells: HashMap<(Uuid, i64, NaiveDate), CellResult>,
    events: Vec<ScrapeEvent>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with hotels named `names`, ids starting at 1.
    pub fn with_hotels(names: &[&str]) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            for name in names {
                state.next_hotel_id += 1;
                let id = state.next_hotel_id;
                state.hotels.insert(
                    id,
                    Hotel {
                        id,
                        name: name.to_string(),
                        source_ref: format!("/hotel/{}", id),
                    },
                );
            }
        }
        store
    }

    pub fn remove_hotel(&self, id: i64) -> Result<()> {
        self.lock()?.hotels.remove(&id);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl ScanStore for InMemoryStore {
    async fn list_hotels(&self) -> Result<Vec<Hotel>> {
        Ok(self.lock()?.hotels.values().cloned().collect())
    }

    async fn add_hotel(&self, name: &str, source_ref: &str) -> Result<Hotel> {
        let mut state = self.lock()?;
        state.next_hotel_id += 1;
        let hotel = Hotel {
            id: state.next_hotel_id,
            name: name.to_string(),
            source_ref: source_ref.to_string(),
        };
        state.hotels.insert(hotel.id, hotel.clone());
        Ok(hotel)
    }

    async fn create_scan(&self, scan: &Scan, hotel_ids: &[i64]) -> Result<()> {
        let mut state = self.lock()?;
        state.scans.insert(scan.id, scan.clone());
        state.snapshots.insert(scan.id, hotel_ids.to_vec());
        Ok(())
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        Ok(self.lock()?.scans.get(&id).cloned())
    }

    async fn list_scans(&self, limit: usize) -> Result<Vec<Scan>> {
        let mut scans: Vec<Scan> = self.lock()?.scans.values().cloned().collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        scans.truncate(limit);
        Ok(scans)
    }

    async fn scan_hotels(&self, id: Uuid) -> Result<Vec<Hotel>> {
        let state = self.lock()?;
        let Some(ids) = state.snapshots.get(&id) else {
            return Ok(Vec::new());
        };
        // A hotel deleted after the snapshot was taken drops out here, which
        // the orchestrator detects as a size mismatch.
        Ok(ids
            .iter()
            .filter_map(|hid| state.hotels.get(hid).cloned())
            .collect())
    }

    async fn oldest_resumable_scan(&self) -> Result<Option<Scan>> {
        Ok(self
            .lock()?
            .scans
            .values()
            .filter(|s| s.is_resumable())
            .min_by_key(|s| s.created_at)
            .cloned())
    }

    async fn add_completed(&self, id: Uuid, processed: u64) -> Result<Option<Scan>> {
        let mut state = self.lock()?;
        let Some(scan) = state.scans.get_mut(&id) else {
            return Ok(None);
        };
        scan.completed = scan.completed.saturating_add(processed).min(scan.total);
        if scan.status == ScanStatus::Running && scan.completed >= scan.total {
            scan.status = ScanStatus::Done;
        }
        Ok(Some(scan.clone()))
    }

    async fn finish_if_complete(&self, id: Uuid) -> Result<Option<Scan>> {
        self.add_completed(id, 0).await
    }

    async fn cancel_scan(&self, id: Uuid) -> Result<CancelOutcome> {
        let mut state = self.lock()?;
        let Some(scan) = state.scans.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if !scan.status.is_cancellable() {
            return Ok(CancelOutcome::AlreadyTerminal(scan.clone()));
        }
        scan.status = ScanStatus::Cancelled;
        Ok(CancelOutcome::Cancelled(scan.clone()))
    }

    async fn fail_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        let mut state = self.lock()?;
        let Some(scan) = state.scans.get_mut(&id) else {
            return Ok(None);
        };
        if !scan.status.is_terminal() {
            scan.status = ScanStatus::Error;
        }
        Ok(Some(scan.clone()))
    }

    async fn upsert_cell(&self, cell: &CellResult) -> Result<()> {
        self.lock()?
            .cells
            .insert((cell.scan_id, cell.hotel_id, cell.check_in), cell.clone());
        Ok(())
    }

    async fn list_cells(&self, scan_id: Uuid) -> Result<Vec<CellResult>> {
        let mut cells: Vec<CellResult> = self
            .lock()?
            .cells
            .values()
            .filter(|c| c.scan_id == scan_id)
            .cloned()
            .collect();
        cells.sort_by(|a, b| (a.hotel_id, a.check_in).cmp(&(b.hotel_id, b.check_in)));
        Ok(cells)
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn append_event(&self, event: &ScrapeEvent) -> Result<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    async fn events_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScrapeEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.scan_id == Some(scan_id))
            .cloned()
            .collect())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ScrapeEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellStatus, NewScan};

    fn params(days: u32) -> NewScan {
        NewScan {
            base_check_in: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            days,
            stay_nights: 1,
            adults: 2,
        }
    }

    #[tokio::test]
    async fn test_add_completed_caps_and_finishes() {
        let store = InMemoryStore::with_hotels(&["A", "B"]);
        let scan = Scan::new(&params(3), 2);
        store.create_scan(&scan, &[1, 2]).await.unwrap();

        let s = store.add_completed(scan.id, 4).await.unwrap().unwrap();
        assert_eq!((s.completed, s.status), (4, ScanStatus::Running));
        let s = store.add_completed(scan.id, 10).await.unwrap().unwrap();
        assert_eq!((s.completed, s.status), (6, ScanStatus::Done));
    }

    #[tokio::test]
    async fn test_cancel_is_conditional() {
        let store = InMemoryStore::with_hotels(&["A"]);
        let scan = Scan::new(&params(2), 1);
        store.create_scan(&scan, &[1]).await.unwrap();

        assert!(matches!(
            store.cancel_scan(scan.id).await.unwrap(),
            CancelOutcome::Cancelled(_)
        ));
        assert!(matches!(
            store.cancel_scan(scan.id).await.unwrap(),
            CancelOutcome::AlreadyTerminal(_)
        ));
        assert_eq!(
            store.cancel_scan(Uuid::new_v4()).await.unwrap(),
            CancelOutcome::NotFound
        );
        // Terminal scans never come back to running through add_completed.
        let s = store.add_completed(scan.id, 2).await.unwrap().unwrap();
        assert_eq!(s.status, ScanStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_upsert_cell_overwrites() {
        let store = InMemoryStore::new();
        let scan_id = Uuid::new_v4();
        let mut cell = CellResult {
            scan_id,
            hotel_id: 1,
            check_in: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            status: CellStatus::Red,
            payload: serde_json::json!({}),
            price: None,
            currency: None,
            updated_at: Utc::now(),
        };
        store.upsert_cell(&cell).await.unwrap();
        cell.status = CellStatus::Green;
        cell.price = Some(99.0);
        store.upsert_cell(&cell).await.unwrap();

        let cells = store.list_cells(scan_id).await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].status, CellStatus::Green);
    }
}
