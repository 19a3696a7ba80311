//! Flat index <-> (hotel, date) mapping over the scan grid.
//!
//! The grid is hotel-major: index `i` maps to hotel `i / days` and date
//! column `i % days`. Nothing here allocates the cartesian product; a batch
//! only ever materialises its own slice.

use std::ops::Range;

/// Position of one cell inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub index: u64,
    pub hotel_ordinal: usize,
    pub date_ordinal: u32,
}

/// Decomposes `index` for a grid with `days` date columns.
///
/// Callers validate `days > 0` and `index < hotel_count * days`.
pub fn work_item(days: u32, index: u64) -> WorkItem {
    let days = days as u64;
    WorkItem {
        index,
        hotel_ordinal: (index / days) as usize,
        date_ordinal: (index % days) as u32,
    }
}

/// Clamps a requested slice onto `[0, total]`.
pub fn clamp_slice(total: u64, start: u64, size: u64) -> Range<u64> {
    let start = start.min(total);
    let end = total.min(start.saturating_add(size));
    start..end
}

/// Lazily yields the work items of `range`.
pub fn slice(days: u32, range: Range<u64>) -> impl Iterator<Item = WorkItem> {
    range.map(move |index| work_item(days, index))
}
